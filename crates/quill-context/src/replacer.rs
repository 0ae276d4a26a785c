//! Ordered regex rewriting of model output.

use quill_core::ReplacementRule;
use regex::Regex;
use tracing::warn;

use crate::error::{ContextError, ContextResult};

fn compile(pattern: &str) -> ContextResult<Regex> {
    Regex::new(pattern).map_err(|err| ContextError::Pattern {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

/// Translate a rule template into `regex` expansion syntax.
///
/// `$1`..`$99` refer to groups only when the group exists (two digits are
/// tried first); `$<name>` is a named group, `$&` the whole match and `$$` a
/// literal dollar. Any other `$` is kept literally.
pub fn translate_template(template: &str, group_count: usize) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        match chars.get(i + 1) {
            Some('$') => {
                out.push_str("$$");
                i += 2;
            }
            Some('&') => {
                out.push_str("${0}");
                i += 2;
            }
            Some('<') => match chars[i + 2..].iter().position(|c| *c == '>') {
                Some(len) if len > 0 => {
                    let name: String = chars[i + 2..i + 2 + len].iter().collect();
                    out.push_str(&format!("${{{name}}}"));
                    i += len + 3;
                }
                _ => {
                    out.push_str("$$");
                    i += 1;
                }
            },
            Some(d) if d.is_ascii_digit() => {
                let first = d.to_digit(10).unwrap_or_default() as usize;
                let two = chars
                    .get(i + 2)
                    .and_then(|c| c.to_digit(10))
                    .map(|second| first * 10 + second as usize);

                match two {
                    Some(group) if group > 0 && group < group_count => {
                        out.push_str(&format!("${{{group}}}"));
                        i += 3;
                    }
                    _ if first > 0 && first < group_count => {
                        out.push_str(&format!("${{{first}}}"));
                        i += 2;
                    }
                    _ => {
                        out.push_str("$$");
                        i += 1;
                    }
                }
            }
            _ => {
                out.push_str("$$");
                i += 1;
            }
        }
    }
    out
}

/// Ordered list of replacement rules applied to model output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseReplacer {
    rules: Vec<ReplacementRule>,
}

impl ResponseReplacer {
    pub fn new(rules: Vec<ReplacementRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ReplacementRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules with a non-empty pattern.
    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|rule| rule.is_enabled()).count()
    }

    /// Run every enabled rule once, in order, over the running result.
    pub fn apply(&self, text: &str) -> String {
        let mut result = text.to_string();

        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.is_enabled() {
                continue;
            }
            let regex = match compile(&rule.pattern) {
                Ok(regex) => regex,
                Err(err) => {
                    warn!(rule = index, error = %err, "Replacer: skipping rule");
                    continue;
                }
            };

            let template = translate_template(&rule.replacement, regex.captures_len());
            result = regex.replace_all(&result, template.as_str()).into_owned();
        }
        result
    }

    fn checked(rule: ReplacementRule) -> ContextResult<ReplacementRule> {
        rule.validate()?;
        compile(&rule.pattern)?;
        Ok(rule)
    }

    /// Append a rule after validating its pattern.
    pub fn add(&mut self, rule: ReplacementRule) -> ContextResult<usize> {
        self.rules.push(Self::checked(rule)?);
        Ok(self.rules.len() - 1)
    }

    pub fn update(&mut self, index: usize, rule: ReplacementRule) -> ContextResult<bool> {
        let rule = Self::checked(rule)?;
        match self.rules.get_mut(index) {
            Some(slot) => {
                *slot = rule;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<ReplacementRule> {
        (index < self.rules.len()).then(|| self.rules.remove(index))
    }

    pub fn move_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.rules.len() {
            return false;
        }
        self.rules.swap(index - 1, index);
        true
    }

    pub fn move_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.rules.len() {
            return false;
        }
        self.rules.swap(index, index + 1);
        true
    }

    /// Bulk replace from an import. Stored rules are not compiled here; bad
    /// patterns are skipped at apply time.
    pub fn replace_all(&mut self, rules: Vec<ReplacementRule>) {
        self.rules = rules;
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }
}
