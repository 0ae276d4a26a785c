//! Application settings that drive context assembly

use quill_runtime::GenerationConfig;
use serde::{Deserialize, Serialize};

use crate::notes::NoteSettings;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub const DEFAULT_COMPRESSION_PROMPT: &str = "Summarize everything that has happened in this \
conversation so far: the facts of each event and how every character behaved at the time. \
Be as detailed as you can and do not worry about length. This will be used as summary data, \
so ignore any existing format and do not use Markdown; write it the way a synopsis of a novel \
would read. Do not reply to this request, start the summary immediately.";

/// Settings persisted under `settings/app`.
///
/// Unknown or missing fields fall back to their defaults so older saved
/// settings keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub model_name: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub thinking_budget: Option<i32>,
    pub include_thoughts: bool,
    pub streaming_output: bool,

    /// Substitute the stored summary when sending
    pub compression_mode: bool,
    pub compression_prompt: String,
    pub keep_first_messages: usize,
    pub keep_last_messages: usize,
    /// Cached token count of `compression_prompt`
    pub compression_prompt_token_count: Option<u32>,

    pub context_note_random_frequency: f64,
    pub context_note_random_count: usize,
    /// Trailing messages scanned for note keywords
    pub context_note_message_count: usize,
    pub context_note_max_chars: usize,
    /// Messages from the end of the history before which notes are inserted
    pub context_note_insertion_priority: usize,
    pub keyword_match_enabled: bool,
    pub always_send_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            temperature: None,
            max_tokens: None,
            top_k: None,
            top_p: None,
            thinking_budget: None,
            include_thoughts: true,
            streaming_output: false,
            compression_mode: true,
            compression_prompt: DEFAULT_COMPRESSION_PROMPT.to_string(),
            keep_first_messages: 5,
            keep_last_messages: 20,
            compression_prompt_token_count: None,
            context_note_random_frequency: 0.3,
            context_note_random_count: 1,
            context_note_message_count: 6,
            context_note_max_chars: 5000,
            context_note_insertion_priority: 2,
            keyword_match_enabled: true,
            always_send_enabled: true,
        }
    }
}

impl Settings {
    /// Clamp values loaded from storage into their valid ranges.
    pub fn normalized(mut self) -> Self {
        if !self.context_note_random_frequency.is_finite() {
            self.context_note_random_frequency = 0.0;
        }
        self.context_note_random_frequency = self.context_note_random_frequency.clamp(0.0, 1.0);
        self.context_note_random_count = self.context_note_random_count.max(1);
        if self.model_name.trim().is_empty() {
            self.model_name = DEFAULT_MODEL.to_string();
        }
        self
    }

    /// Change the compaction instruction, dropping its cached token count.
    pub fn set_compression_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        if prompt != self.compression_prompt {
            self.compression_prompt = prompt;
            self.compression_prompt_token_count = None;
        }
    }

    /// Generation parameters for a regular chat turn.
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            max_output_tokens: self.max_tokens,
            top_k: self.top_k,
            top_p: self.top_p,
            thinking_budget: self.thinking_budget,
            include_thoughts: self.include_thoughts,
        }
    }

    pub fn note_settings(&self) -> NoteSettings {
        NoteSettings {
            random_frequency: self.context_note_random_frequency,
            random_count: self.context_note_random_count,
            keyword_match_enabled: self.keyword_match_enabled,
            always_send_enabled: self.always_send_enabled,
        }
    }

    pub fn system_instruction(&self) -> Option<String> {
        (!self.system_prompt.trim().is_empty()).then(|| self.system_prompt.clone())
    }
}
