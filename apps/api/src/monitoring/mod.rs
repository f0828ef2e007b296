//! Monitoring: identifiers a user wants re-checked for new exposures.

pub mod handlers;
pub mod models;
pub mod scanner;
pub mod store;

pub use scanner::Scanner;
#[cfg(test)]
pub use store::InMemoryMonitoringStore;
pub use store::{MonitoringStore, PgMonitoringStore};
