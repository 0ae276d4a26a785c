//! Context notes: user-authored snippets injected alongside the history.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// How a note reaches the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    /// Sent when one of its keywords appears in recent text.
    Keyword,
    /// Eligible for random sampling.
    Moment,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Keyword => "keyword",
            NoteKind::Moment => "moment",
        }
    }
}

impl std::fmt::Display for NoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NoteKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "keyword" => Ok(NoteKind::Keyword),
            "moment" => Ok(NoteKind::Moment),
            other => Err(CoreError::UnknownNoteKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    #[serde(rename = "type")]
    pub kind: NoteKind,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Note {
    /// Build a note from editor input. Title and content are required.
    pub fn new(
        kind: NoteKind,
        title: impl Into<String>,
        content: impl Into<String>,
        keywords: Vec<String>,
    ) -> CoreResult<Self> {
        let note = Self {
            kind,
            title: title.into(),
            content: content.into(),
            keywords,
            category: None,
        };
        note.validate()?;
        Ok(note)
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        let category = category.into();
        self.category = (!category.trim().is_empty()).then_some(category);
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.title.trim().is_empty() {
            return Err(CoreError::EmptyField { field: "title" });
        }
        if self.content.trim().is_empty() {
            return Err(CoreError::EmptyField { field: "content" });
        }
        Ok(())
    }

    /// First line of the content.
    pub fn summary(&self) -> &str {
        self.content.split('\n').next().unwrap_or_default()
    }

    /// Keywords used for matching; the title stands in when none are set.
    pub fn effective_keywords(&self) -> Vec<&str> {
        if self.keywords.is_empty() {
            vec![self.title.as_str()]
        } else {
            self.keywords.iter().map(String::as_str).collect()
        }
    }

    /// Substring match on the first hit of any effective keyword.
    pub fn matches(&self, text: &str) -> bool {
        self.effective_keywords()
            .into_iter()
            .any(|keyword| text.contains(keyword))
    }
}

/// Split a comma separated keyword field into trimmed, non-empty keywords.
pub fn parse_keywords(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|keyword| !keyword.is_empty())
        .map(str::to_string)
        .collect()
}
