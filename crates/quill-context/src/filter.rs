//! Selection of the history entries that may be transmitted

use quill_core::Message;

/// Picks the subsequence of a history that is eligible for sending.
///
/// Compaction indices are expressed in the index space of this filtered
/// sequence, so the same filter must be used when planning and when sending.
pub trait EligibilityFilter: Send + Sync {
    fn eligible(&self, history: &[Message]) -> Vec<Message>;
}

/// Drops entries with blank content (failed or interrupted turns).
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyFilter;

impl EligibilityFilter for NonEmptyFilter {
    fn eligible(&self, history: &[Message]) -> Vec<Message> {
        history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .cloned()
            .collect()
    }
}
