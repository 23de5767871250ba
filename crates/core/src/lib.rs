//! Domain types and pure policies for course publishing and certificate issuance.

pub mod allowlist;
pub mod authoring;
pub mod certificates;
pub mod keys;
pub mod messages;
pub mod outline;
pub mod projector;

pub use keys::{CourseKey, KeyError, UsageKey};
