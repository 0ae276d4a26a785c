//! Building the outbound request for one turn.

use std::sync::Arc;

use quill_core::Message;
use quill_runtime::{GenerateRequest, Turn};
use rand::Rng;
use tracing::debug;

use crate::compaction::apply_for_transmission;
use crate::filter::EligibilityFilter;
use crate::notes::NoteBook;
use crate::replacer::ResponseReplacer;
use crate::session::Session;
use crate::settings::Settings;

/// Request for one turn plus what went into it.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledRequest {
    pub request: GenerateRequest,
    /// Note text injected as an extra user turn, empty when none
    pub note_text: String,
    /// Whether a summary replaced part of the history
    pub compacted: bool,
    /// Eligible history length before substitution
    pub eligible_count: usize,
}

/// Filter, substitute, inject notes.
pub struct ContextAssembler {
    settings: Settings,
    filter: Arc<dyn EligibilityFilter>,
}

impl ContextAssembler {
    pub fn new(settings: Settings, filter: Arc<dyn EligibilityFilter>) -> Self {
        Self { settings, filter }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Text the note matcher scans: the trailing eligible messages.
    pub fn scan_text(&self, eligible: &[Message]) -> String {
        let skip = eligible
            .len()
            .saturating_sub(self.settings.context_note_message_count);
        eligible[skip..]
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Always-send digest followed by matched notes, capped in characters.
    pub fn note_text<R: Rng + ?Sized>(&self, notes: &NoteBook, scan: &str, rng: &mut R) -> String {
        let text = [
            notes.always_send_summary(),
            notes.matched_text_with_settings(scan, rng),
        ]
        .into_iter()
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

        if text.chars().count() > self.settings.context_note_max_chars {
            text.chars()
                .take(self.settings.context_note_max_chars)
                .collect()
        } else {
            text
        }
    }

    pub fn assemble<R: Rng + ?Sized>(
        &self,
        session: &Session,
        notes: &NoteBook,
        rng: &mut R,
    ) -> AssembledRequest {
        let eligible = self.filter.eligible(&session.messages);
        let state = session
            .compaction
            .as_ref()
            .filter(|_| self.settings.compression_mode);
        let outbound = apply_for_transmission(&eligible, state);

        let mut contents: Vec<Turn> = outbound.iter().map(Turn::from).collect();
        let note_text = self.note_text(notes, &self.scan_text(&eligible), rng);
        if !note_text.is_empty() {
            let at = contents
                .len()
                .saturating_sub(self.settings.context_note_insertion_priority);
            contents.insert(at, Turn::user(note_text.clone()));
        }

        debug!(
            session = %session.id,
            eligible = eligible.len(),
            turns = contents.len(),
            compacted = state.is_some(),
            note_chars = note_text.chars().count(),
            "Assembler: request built"
        );

        let request = GenerateRequest {
            contents,
            model: Some(self.settings.model_name.clone()),
            generation_config: self.settings.generation_config(),
            system_instruction: self.settings.system_instruction(),
        };

        AssembledRequest {
            request,
            note_text,
            compacted: state.is_some(),
            eligible_count: eligible.len(),
        }
    }

    /// Apply the replacement rules to model output before display.
    pub fn finish(&self, replacer: &ResponseReplacer, text: &str) -> String {
        replacer.apply(text)
    }
}
