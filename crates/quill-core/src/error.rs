//! Validation errors for core domain types.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("{field} cannot be empty")]
    EmptyField { field: &'static str },
    #[error("unknown note type: {0}")]
    UnknownNoteKind(String),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
