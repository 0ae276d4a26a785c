//! Quill core domain types shared by every stage of the context pipeline.

pub mod compaction;
pub mod error;
pub mod message;
pub mod note;
pub mod rule;
pub mod session;

pub use compaction::CompactionState;
pub use error::{CoreError, CoreResult};
pub use message::{estimate_tokens, Message, Role, UsageMetadata};
pub use note::{parse_keywords, Note, NoteKind};
pub use rule::ReplacementRule;
pub use session::SessionId;
