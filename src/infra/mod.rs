//! Infrastructure adapters for storage and notifications.

pub mod notify;
pub mod store;

pub use notify::InMemoryNotifier;
pub use store::InMemoryStore;
