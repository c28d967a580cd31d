//! Shared utilities.

pub mod cache;
pub mod telemetry;

pub use cache::TtlCache;
pub use telemetry::*;
