//! Notification channel backends.

pub mod memory;

pub use memory::InMemoryNotifier;
