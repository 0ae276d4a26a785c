//! Quill persistence - key-value store abstraction
//!
//! This crate provides:
//! - `KeyValueStore` trait: async get/put/delete keyed by store name and key
//! - In-memory store for testing
//! - JSON file store for the command line client
//! - Typed load/save helpers over serde

pub mod error;
pub mod file;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use file::JsonFileStore;
pub use store::{delete, load, save, InMemoryStore, KeyValueStore};

/// Store names used by the pipeline.
pub mod stores {
    /// Application settings, context notes and replacement rules.
    pub const SETTINGS: &str = "settings";
    /// One entry per chat session.
    pub const SESSIONS: &str = "sessions";
}

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{StoreError, StoreResult};
    pub use crate::store::{load, save, KeyValueStore};
    pub use crate::stores;
}
