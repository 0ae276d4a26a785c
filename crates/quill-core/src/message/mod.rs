//! Chat messages as the pipeline sees them.
//!
//! A [`Message`] is the single tagged shape used inside Quill. Provider
//! adapters translate it to and from their wire format at the edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token usage reported by the model service for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub total_token_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<u32>,
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
}

impl UsageMetadata {
    /// Total tokens excluding reasoning tokens.
    pub fn effective_total(&self) -> u32 {
        self.total_token_count
            .saturating_sub(self.thoughts_token_count.unwrap_or(0))
    }
}

/// One entry of a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    /// Reasoning text returned alongside the answer. Shown, never sent back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            usage_metadata: None,
            thoughts: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::new(Role::Model, content)
    }

    pub fn with_usage(mut self, usage: UsageMetadata) -> Self {
        self.usage_metadata = Some(usage);
        self
    }

    pub fn with_thoughts(mut self, thoughts: impl Into<String>) -> Self {
        let thoughts = thoughts.into();
        if !thoughts.is_empty() {
            self.thoughts = Some(thoughts);
        }
        self
    }

    /// Character-based token estimate of the content.
    pub fn estimated_tokens(&self) -> u32 {
        estimate_tokens(&self.content)
    }
}

/// Rough token estimate used when the model service reports nothing
/// (approximately 4 characters per token, rounded up).
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    chars.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{estimate_tokens, Message, Role, UsageMetadata};

    proptest! {
        #[test]
        fn estimate_covers_every_character(text in "\\PC{0,200}") {
            let chars = text.chars().count() as u32;
            let estimate = estimate_tokens(&text);
            prop_assert!(estimate * 4 >= chars);
            prop_assert!(estimate * 4 < chars + 4);
        }
    }

    #[test]
    fn estimate_rounds_up_per_four_characters() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // counted in characters, not bytes
        assert_eq!(estimate_tokens("こんにちは"), 2);
    }

    #[test]
    fn effective_total_excludes_thoughts() {
        let usage = UsageMetadata {
            total_token_count: 1200,
            thoughts_token_count: Some(200),
            prompt_token_count: 900,
            candidates_token_count: 100,
        };
        assert_eq!(usage.effective_total(), 1000);

        let no_thoughts = UsageMetadata {
            thoughts_token_count: None,
            ..usage
        };
        assert_eq!(no_thoughts.effective_total(), 1200);
    }

    #[test]
    fn message_json_uses_client_field_names() {
        let message = Message::model("hi").with_usage(UsageMetadata {
            total_token_count: 10,
            thoughts_token_count: None,
            prompt_token_count: 7,
            candidates_token_count: 3,
        });

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "model");
        assert_eq!(value["usageMetadata"]["totalTokenCount"], 10);
        assert!(value["usageMetadata"].get("thoughtsTokenCount").is_none());
        assert!(value.get("thoughts").is_none());
    }

    #[test]
    fn empty_thoughts_are_not_stored() {
        let message = Message::new(Role::Model, "answer").with_thoughts("");
        assert!(message.thoughts.is_none());
    }
}
