pub mod guard;
pub mod redaction;
pub mod tiers;
pub mod usage;

pub use guard::{Grant, Guard, Requirement};
pub use tiers::Feature;
