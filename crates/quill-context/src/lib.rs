//! Quill context assembly
//!
//! This crate decides what each turn sends to the model:
//! - Compaction of the middle of a history into a generated summary
//! - Context notes matched by keyword, sampled at random or always sent
//! - Replacement rules applied to model output before display
//! - A session manager that runs turns and persists their inputs

pub mod assembler;
pub mod compaction;
pub mod error;
pub mod filter;
pub mod interchange;
pub mod manager;
pub mod notes;
pub mod replacer;
pub mod session;
pub mod settings;

pub use assembler::{AssembledRequest, ContextAssembler};
pub use compaction::{apply_for_transmission, CompactionEngine, CompactionPlan};
pub use error::{ContextError, ContextResult};
pub use filter::{EligibilityFilter, NonEmptyFilter};
pub use manager::{CompactionReport, SessionManager, TurnOutcome};
pub use notes::{NoteBook, NoteSettings};
pub use replacer::ResponseReplacer;
pub use session::Session;
pub use settings::Settings;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{ContextError, ContextResult};
    pub use crate::manager::SessionManager;
    pub use crate::notes::NoteBook;
    pub use crate::replacer::ResponseReplacer;
    pub use crate::session::Session;
    pub use crate::settings::Settings;
}
