//! Response replacement rules.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// A regular-expression pattern and the template that replaces its matches.
///
/// The template follows the chat client's conventions: `$1`/`$12` for
/// numbered groups, `$<name>` for named groups, `$&` for the whole match and
/// `$$` for a literal dollar sign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

impl ReplacementRule {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    /// Rules with an empty pattern are kept but never applied.
    pub fn is_enabled(&self) -> bool {
        !self.pattern.is_empty()
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.pattern.trim().is_empty() {
            return Err(CoreError::EmptyField { field: "pattern" });
        }
        Ok(())
    }
}
