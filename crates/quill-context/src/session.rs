//! Chat sessions

use chrono::{DateTime, Utc};
use quill_core::{CompactionState, Message, SessionId};
use serde::{Deserialize, Serialize};

use crate::error::{ContextError, ContextResult};

const TITLE_CHARS: usize = 30;

/// One conversation: its history plus at most one compaction.
///
/// Every pipeline stage receives the session explicitly; nothing reads
/// conversation state from a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    compaction_in_flight: bool,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            title: title.into(),
            messages: Vec::new(),
            compaction: None,
            created_at: now,
            updated_at: now,
            compaction_in_flight: false,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Title, or the start of the first user message when untitled.
    pub fn display_title(&self) -> String {
        if !self.title.trim().is_empty() {
            return self.title.clone();
        }
        self.messages
            .iter()
            .find(|message| message.role == quill_core::Role::User)
            .map(|message| message.content.chars().take(TITLE_CHARS).collect())
            .unwrap_or_else(|| "(untitled)".to_string())
    }

    /// Latest reported context size, excluding reasoning tokens.
    pub fn current_total_tokens(&self) -> u64 {
        self.messages
            .iter()
            .rev()
            .find_map(|message| message.usage_metadata)
            .map_or(0, |usage| u64::from(usage.effective_total()))
    }

    /// Context size as it would be without the active compaction.
    pub fn original_token_estimate(&self) -> Option<u64> {
        self.compaction
            .as_ref()
            .map(|state| state.original_token_estimate(self.current_total_tokens()))
    }

    /// Install a new compaction, returning the one it replaces.
    pub fn replace_compaction(&mut self, state: CompactionState) -> Option<CompactionState> {
        self.updated_at = Utc::now();
        self.compaction.replace(state)
    }

    pub fn is_compacting(&self) -> bool {
        self.compaction_in_flight
    }

    /// Mark a compaction as pending; a second request is rejected until
    /// [`Session::end_compaction`] runs.
    pub fn begin_compaction(&mut self) -> ContextResult<()> {
        if self.compaction_in_flight {
            return Err(ContextError::CompactionInFlight(self.id));
        }
        self.compaction_in_flight = true;
        Ok(())
    }

    pub fn end_compaction(&mut self) {
        self.compaction_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::Session;
    use crate::error::ContextError;
    use quill_core::{Message, UsageMetadata};

    fn usage(total: u32, thoughts: Option<u32>) -> UsageMetadata {
        UsageMetadata {
            total_token_count: total,
            thoughts_token_count: thoughts,
            prompt_token_count: 0,
            candidates_token_count: 0,
        }
    }

    #[test]
    fn current_total_uses_latest_usage() {
        let mut session = Session::new("test");
        assert_eq!(session.current_total_tokens(), 0);

        session.push(Message::user("a"));
        session.push(Message::model("b").with_usage(usage(100, None)));
        session.push(Message::user("c"));
        session.push(Message::model("d").with_usage(usage(250, Some(50))));
        session.push(Message::user("e"));

        assert_eq!(session.current_total_tokens(), 200);
    }

    #[test]
    fn second_compaction_is_rejected_while_pending() {
        let mut session = Session::new("test");
        session.begin_compaction().unwrap();

        let err = session.begin_compaction().unwrap_err();
        assert!(matches!(err, ContextError::CompactionInFlight(id) if id == session.id));

        session.end_compaction();
        assert!(session.begin_compaction().is_ok());
    }

    #[test]
    fn in_flight_marker_is_not_persisted() {
        let mut session = Session::new("test");
        session.begin_compaction().unwrap();

        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();

        assert!(!restored.is_compacting());
        assert_eq!(restored.id, session.id);
    }

    #[test]
    fn display_title_falls_back_to_first_user_message() {
        let mut session = Session::new("");
        assert_eq!(session.display_title(), "(untitled)");
        session.push(Message::user("Tell me about the lighthouse keeper"));
        assert_eq!(session.display_title(), "Tell me about the lighthouse k");
    }
}
