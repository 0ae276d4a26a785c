//! Error types for context assembly

use quill_core::{CoreError, SessionId};
use quill_runtime::ProviderError;
use quill_store::StoreError;
use thiserror::Error;

/// Context pipeline error type
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Validation error: {0}")]
    Validation(#[from] CoreError),

    #[error("Invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("Model service error: {0}")]
    Service(#[from] ProviderError),

    #[error("Nothing to compact: {total} messages fit within the retained windows")]
    EmptySelection { total: usize },

    #[error("Compaction already in progress for session {0}")]
    CompactionInFlight(SessionId),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Import error: {0}")]
    Interchange(String),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;
