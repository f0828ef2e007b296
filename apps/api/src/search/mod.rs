//! Breach search: validated lookups fanned out to every configured source,
//! merged, then redacted for the caller's tier.

pub mod aggregator;
pub mod handlers;
pub mod models;
pub mod sources;

pub use aggregator::SearchAggregator;
pub use models::SearchKind;
pub use sources::{BreachSource, ElasticsearchSource, LeakCheckSource};
