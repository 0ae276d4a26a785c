//! Compaction: replacing the middle of a history with a generated summary.
//!
//! The history is split into a retained-first window, a middle and a
//! retained-last window. The middle is summarized by the model and recorded
//! as a [`CompactionState`]; when sending, the summarized positions collapse
//! into one synthetic user message.

use std::borrow::Cow;

use chrono::Utc;
use quill_core::{estimate_tokens, CompactionState, Message};
use quill_runtime::{AIProvider, GenerateRequest, GenerationConfig, ProviderError, Turn};
use tracing::{debug, info};

use crate::error::{ContextError, ContextResult};
use crate::session::Session;
use crate::settings::Settings;

/// Prefix of the synthetic message that stands in for the compacted range.
pub const SUMMARY_PREFIX: &str = "[summary] ";

/// Sampling temperature for summary requests.
pub const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Partition of a history around the retained windows.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPlan {
    pub keep_first: usize,
    pub first: Vec<Message>,
    pub middle: Vec<Message>,
    pub last: Vec<Message>,
    pub total_messages: usize,
}

impl CompactionPlan {
    pub fn compacted_count(&self) -> usize {
        self.middle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middle.is_empty()
    }
}

/// Split `history` into first/middle/last windows.
///
/// When the windows cover the whole history the plan has an empty middle and
/// `first` holds everything.
pub fn plan(history: &[Message], keep_first: usize, keep_last: usize) -> CompactionPlan {
    let total_messages = history.len();

    if total_messages <= keep_first.saturating_add(keep_last) {
        return CompactionPlan {
            keep_first,
            first: history.to_vec(),
            middle: Vec::new(),
            last: Vec::new(),
            total_messages,
        };
    }

    let last_start = total_messages - keep_last;
    CompactionPlan {
        keep_first,
        first: history[..keep_first].to_vec(),
        middle: history[keep_first..last_start].to_vec(),
        last: history[last_start..].to_vec(),
        total_messages,
    }
}

/// Summary request: the middle as role-tagged turns, then the instruction.
///
/// Reasoning output is always disabled and the temperature fixed, regardless
/// of the chat settings.
pub fn build_summary_request(middle: &[Message], instruction_prompt: &str) -> GenerateRequest {
    let mut contents: Vec<Turn> = middle.iter().map(Turn::from).collect();
    contents.push(Turn::user(instruction_prompt));

    GenerateRequest {
        contents,
        model: None,
        generation_config: GenerationConfig {
            temperature: Some(SUMMARY_TEMPERATURE),
            include_thoughts: false,
            ..GenerationConfig::default()
        },
        system_instruction: None,
    }
}

/// Token figures gathered while producing a summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenAccounting {
    /// Prompt tokens billed for the summary request
    pub prompt_token_count: Option<u32>,
    /// Tokens of the instruction prompt alone
    pub instruction_token_count: u32,
    /// Output tokens of the summary
    pub candidates_token_count: Option<u32>,
    /// Session total at the time of compaction
    pub total_tokens_before: u64,
}

/// Build the state recording `summary_text` for `plan`.
pub fn commit(
    plan: &CompactionPlan,
    summary_text: &str,
    accounting: TokenAccounting,
) -> ContextResult<CompactionState> {
    if plan.is_empty() {
        return Err(ContextError::EmptySelection {
            total: plan.total_messages,
        });
    }
    if summary_text.trim().is_empty() {
        return Err(ContextError::Service(ProviderError::EmptyResponse));
    }

    let original_token_count = match accounting.prompt_token_count {
        Some(prompt) => prompt.saturating_sub(accounting.instruction_token_count),
        None => plan.middle.iter().map(Message::estimated_tokens).sum(),
    };
    let compressed_token_count = accounting
        .candidates_token_count
        .filter(|count| *count > 0)
        .unwrap_or_else(|| estimate_tokens(summary_text));

    Ok(CompactionState {
        start_index: plan.keep_first,
        end_index: plan.keep_first + plan.compacted_count() - 1,
        summary_text: summary_text.to_string(),
        original_token_count: u64::from(original_token_count),
        compressed_token_count: u64::from(compressed_token_count),
        total_tokens_before_compaction: accounting.total_tokens_before,
        timestamp: Utc::now(),
    })
}

/// Outbound history with the compacted range collapsed into one summary
/// message. Without a state the input is returned as is.
pub fn apply_for_transmission<'a>(
    history: &'a [Message],
    state: Option<&CompactionState>,
) -> Cow<'a, [Message]> {
    let Some(state) = state else {
        return Cow::Borrowed(history);
    };

    let mut outbound = Vec::with_capacity(history.len());
    for (index, message) in history.iter().enumerate() {
        if !state.contains(index) {
            outbound.push(message.clone());
        } else if index == state.start_index {
            outbound.push(summary_message(state));
        }
    }
    Cow::Owned(outbound)
}

fn summary_message(state: &CompactionState) -> Message {
    let mut message = Message::user(format!("{SUMMARY_PREFIX}{}", state.summary_text));
    message.timestamp = state.timestamp;
    message
}

/// Summary text and token figures returned by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub text: String,
    pub accounting: TokenAccounting,
}

/// Compaction driven by the session settings.
#[derive(Debug, Clone)]
pub struct CompactionEngine {
    keep_first: usize,
    keep_last: usize,
    instruction_prompt: String,
    model: String,
}

impl CompactionEngine {
    pub fn new(
        keep_first: usize,
        keep_last: usize,
        instruction_prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            keep_first,
            keep_last,
            instruction_prompt: instruction_prompt.into(),
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.keep_first_messages,
            settings.keep_last_messages,
            settings.compression_prompt.clone(),
            settings.model_name.clone(),
        )
    }

    pub fn instruction_prompt(&self) -> &str {
        &self.instruction_prompt
    }

    pub fn plan(&self, history: &[Message]) -> CompactionPlan {
        plan(history, self.keep_first, self.keep_last)
    }

    pub fn summary_request(&self, plan: &CompactionPlan) -> GenerateRequest {
        build_summary_request(&plan.middle, &self.instruction_prompt).with_model(self.model.clone())
    }

    /// Token count of the instruction prompt, from the service when possible.
    pub async fn instruction_tokens(&self, provider: &dyn AIProvider) -> u32 {
        let request = GenerateRequest::new(vec![Turn::user(self.instruction_prompt.clone())])
            .with_model(self.model.clone());
        match provider.count_tokens(request).await {
            Ok(count) => count,
            Err(err) => {
                let estimate = estimate_tokens(&self.instruction_prompt);
                debug!(error = %err, estimate, "countTokens failed, estimating instruction size");
                estimate
            }
        }
    }

    /// Ask the model for a summary of `plan.middle`.
    ///
    /// Nothing is written here; a failure leaves any existing state untouched.
    pub async fn summarize(
        &self,
        provider: &dyn AIProvider,
        plan: &CompactionPlan,
        instruction_token_count: u32,
        total_tokens_before: u64,
    ) -> ContextResult<Summary> {
        if plan.is_empty() {
            return Err(ContextError::EmptySelection {
                total: plan.total_messages,
            });
        }

        debug!(
            total_messages = plan.total_messages,
            to_summarize = plan.compacted_count(),
            model = %self.model,
            "Compaction: requesting summary"
        );

        let response = provider.generate(self.summary_request(plan)).await?;
        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(ContextError::Service(ProviderError::EmptyResponse));
        }

        let usage = response.usage;
        Ok(Summary {
            text,
            accounting: TokenAccounting {
                prompt_token_count: usage.map(|usage| usage.prompt_token_count),
                instruction_token_count,
                candidates_token_count: usage.map(|usage| usage.candidates_token_count),
                total_tokens_before,
            },
        })
    }

    /// Record `summary` on the session, replacing any previous compaction.
    pub fn commit(
        &self,
        session: &mut Session,
        plan: &CompactionPlan,
        summary: &Summary,
    ) -> ContextResult<CompactionState> {
        let state = commit(plan, &summary.text, summary.accounting)?;
        let previous = session.replace_compaction(state.clone());

        info!(
            session = %session.id,
            start_index = state.start_index,
            end_index = state.end_index,
            original_tokens = state.original_token_count,
            compressed_tokens = state.compressed_token_count,
            replaced_previous = previous.is_some(),
            "Compaction: complete"
        );
        Ok(state)
    }
}
