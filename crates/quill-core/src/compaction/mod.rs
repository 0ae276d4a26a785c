//! Persistent record of one applied compaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contiguous run of filtered-history positions replaced by a summary.
///
/// Indices are inclusive and refer to the filtered history the compaction
/// was planned over. At most one state exists per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionState {
    pub start_index: usize,
    pub end_index: usize,
    pub summary_text: String,
    pub original_token_count: u64,
    pub compressed_token_count: u64,
    pub total_tokens_before_compaction: u64,
    pub timestamp: DateTime<Utc>,
}

impl CompactionState {
    pub fn contains(&self, index: usize) -> bool {
        (self.start_index..=self.end_index).contains(&index)
    }

    pub fn tokens_saved(&self) -> u64 {
        self.original_token_count
            .saturating_sub(self.compressed_token_count)
    }

    /// What the live total would be without the compaction.
    pub fn original_token_estimate(&self, current_total: u64) -> u64 {
        current_total
            .saturating_sub(self.compressed_token_count)
            .saturating_add(self.original_token_count)
    }
}
