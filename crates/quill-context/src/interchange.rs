//! Multi-document YAML import and export for notes and rules.

use quill_core::{parse_keywords, Note, NoteKind, ReplacementRule};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::{ContextError, ContextResult};

const DOCUMENT_SEPARATOR: &str = "\n---\n\n";

/// Shown when there are no rules to export.
pub const DEFAULT_RULES_TEMPLATE: &str = r"# Response replacement rules
# Add one rule per document and separate documents with a line of ---

# Example: replace a word
# pattern: Hello
# replacement: Hi

# Example: collapse repeated letters
# pattern: a+
# replacement: a

# Example: use a capture group ('Mr. Name' becomes 'Name-san')
# pattern: Mr\. (\w+)
# replacement: $1-san
";

/// Parse every document, dropping null and non-mapping ones.
fn documents(input: &str) -> ContextResult<Vec<Mapping>> {
    let mut mappings = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let value = Value::deserialize(document)
            .map_err(|err| ContextError::Interchange(err.to_string()))?;
        match value {
            Value::Mapping(mapping) => mappings.push(mapping),
            Value::Null => {}
            other => warn!(kind = ?other, "Interchange: skipping non-mapping document"),
        }
    }
    Ok(mappings)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn field<'a>(mapping: &'a Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(Value::String(key.to_string()))
}

fn required(mapping: &Mapping, index: usize, key: &str) -> ContextResult<String> {
    field(mapping, key)
        .and_then(scalar)
        .ok_or_else(|| ContextError::Interchange(format!("document {index}: missing '{key}'")))
}

fn keywords(value: &Value, index: usize) -> ContextResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => Ok(items
            .iter()
            .filter_map(scalar)
            .map(|keyword| keyword.trim().to_string())
            .filter(|keyword| !keyword.is_empty())
            .collect()),
        other => scalar(other)
            .map(|text| parse_keywords(&text))
            .ok_or_else(|| ContextError::Interchange(format!("document {index}: bad 'keywords'"))),
    }
}

fn note_from(mapping: &Mapping, index: usize) -> ContextResult<Note> {
    let kind: NoteKind = required(mapping, index, "type")?.parse()?;
    let title = required(mapping, index, "title")?;
    let content = required(mapping, index, "content")?;
    let keywords = match field(mapping, "keywords") {
        Some(value) => keywords(value, index)?,
        None => {
            return Err(ContextError::Interchange(format!(
                "document {index}: missing 'keywords'"
            )))
        }
    };

    let mut note = Note::new(kind, title, content, keywords)?;
    if let Some(category) = field(mapping, "category").and_then(scalar) {
        note = note.with_category(category);
    }
    Ok(note)
}

/// Parse notes. One malformed document rejects the whole import.
pub fn notes_from_yaml(input: &str) -> ContextResult<Vec<Note>> {
    let notes = documents(input)?
        .iter()
        .enumerate()
        .map(|(index, mapping)| note_from(mapping, index + 1))
        .collect::<ContextResult<Vec<_>>>()?;

    if notes.is_empty() {
        return Err(ContextError::Interchange("no valid notes found".to_string()));
    }
    Ok(notes)
}

/// Parse rules. Documents without a `pattern` key are skipped.
pub fn rules_from_yaml(input: &str) -> ContextResult<Vec<ReplacementRule>> {
    let rules: Vec<ReplacementRule> = documents(input)?
        .iter()
        .filter_map(|mapping| {
            let pattern = field(mapping, "pattern")?;
            let replacement = field(mapping, "replacement").and_then(scalar);
            Some(ReplacementRule::new(
                scalar(pattern).unwrap_or_default(),
                replacement.unwrap_or_default(),
            ))
        })
        .collect();

    if rules.is_empty() {
        return Err(ContextError::Interchange("no valid rules found".to_string()));
    }
    Ok(rules)
}

fn render<T: serde::Serialize>(items: &[T]) -> ContextResult<String> {
    items
        .iter()
        .map(|item| {
            serde_yaml::to_string(item).map_err(|err| ContextError::Interchange(err.to_string()))
        })
        .collect::<ContextResult<Vec<_>>>()
        .map(|docs| docs.join(DOCUMENT_SEPARATOR))
}

/// One document per note, in collection order.
pub fn notes_to_yaml(notes: &[Note]) -> ContextResult<String> {
    render(notes)
}

/// One document per rule; the commented template when there are none.
pub fn rules_to_yaml(rules: &[ReplacementRule]) -> ContextResult<String> {
    if rules.is_empty() {
        return Ok(DEFAULT_RULES_TEMPLATE.to_string());
    }
    render(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::CoreError;

    const NOTES: &str = r#"
type: keyword
title: Aria
content: |-
  A traveling bard
  She never sings twice
keywords: [bard, Aria]
category: people
---
---
type: moment
title: Rain
content: It rained all night
keywords: storm, rain
"#;

    #[test]
    fn notes_import_parses_every_document() {
        let notes = notes_from_yaml(NOTES).unwrap();
        assert_eq!(notes.len(), 2);

        assert_eq!(notes[0].kind, NoteKind::Keyword);
        assert_eq!(notes[0].summary(), "A traveling bard");
        assert_eq!(notes[0].keywords, vec!["bard", "Aria"]);
        assert_eq!(notes[0].category.as_deref(), Some("people"));

        assert_eq!(notes[1].kind, NoteKind::Moment);
        assert_eq!(notes[1].keywords, vec!["storm", "rain"]);
    }

    #[test]
    fn null_keywords_fall_back_to_title() {
        let notes = notes_from_yaml("type: keyword\ntitle: Aria\ncontent: bard\nkeywords:\n").unwrap();
        assert!(notes[0].keywords.is_empty());
        assert!(notes[0].matches("Aria"));
    }

    #[test]
    fn one_bad_note_rejects_the_import() {
        let input = "type: keyword\ntitle: A\ncontent: a\nkeywords: []\n---\ntitle: B\ncontent: b\nkeywords: []\n";
        let err = notes_from_yaml(input).unwrap_err();
        assert!(matches!(err, ContextError::Interchange(ref msg) if msg.contains("'type'")));

        let missing_keywords = "type: moment\ntitle: A\ncontent: a\n";
        assert!(matches!(
            notes_from_yaml(missing_keywords),
            Err(ContextError::Interchange(_))
        ));

        let unknown_kind = "type: memo\ntitle: A\ncontent: a\nkeywords: []\n";
        assert!(matches!(
            notes_from_yaml(unknown_kind),
            Err(ContextError::Validation(CoreError::UnknownNoteKind(_)))
        ));
    }

    #[test]
    fn import_without_documents_fails() {
        assert!(notes_from_yaml("---\n---\n").is_err());
        assert!(rules_from_yaml("# only a comment\n").is_err());
        assert!(notes_from_yaml("key: [unclosed").is_err());
    }

    #[test]
    fn rules_import_skips_documents_without_pattern() {
        let input = "pattern: a+\nreplacement: a\n---\nreplacement: lost\n---\npattern: b\n";
        let rules = rules_from_yaml(input).unwrap();
        assert_eq!(
            rules,
            vec![ReplacementRule::new("a+", "a"), ReplacementRule::new("b", "")]
        );
    }

    #[test]
    fn notes_export_reimports_unchanged() {
        let notes = notes_from_yaml(NOTES).unwrap();
        let yaml = notes_to_yaml(&notes).unwrap();
        assert!(yaml.contains("\n---\n"));
        assert_eq!(notes_from_yaml(&yaml).unwrap(), notes);
    }

    #[test]
    fn empty_rule_export_is_the_template() {
        let yaml = rules_to_yaml(&[]).unwrap();
        assert_eq!(yaml, DEFAULT_RULES_TEMPLATE);
        assert!(rules_from_yaml(&yaml).is_err());

        let yaml = rules_to_yaml(&[ReplacementRule::new(r"Mr\. (\w+)", "$1-san")]).unwrap();
        assert_eq!(
            rules_from_yaml(&yaml).unwrap(),
            vec![ReplacementRule::new(r"Mr\. (\w+)", "$1-san")]
        );
    }
}
