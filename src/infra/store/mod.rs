//! Storage backends implementing the repository traits.

pub mod memory;

pub use memory::InMemoryStore;
