//! Field templates with `(key)` placeholders.
//!
//! Templates are parsed once when a grant is compiled and rendered per
//! account. Substitution is single-pass: a substituted value is never
//! re-scanned for placeholders.

use std::collections::BTreeMap;

use keysystem_core::{PolicyError, PolicyResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template. Only `(identifier)` forms are placeholders; any other
    /// parenthesis is literal text.
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(open) = rest.find('(') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let ident_len = after
                .char_indices()
                .find(|(_, c)| !is_ident_char(*c))
                .map(|(i, _)| i)
                .unwrap_or(after.len());

            if ident_len > 0 && after[ident_len..].starts_with(')') {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(after[..ident_len].to_string()));
                rest = &after[ident_len + 1..];
            } else {
                literal.push('(');
                rest = after;
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            source: source.to_string(),
            segments,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder keys in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(key) => Some(key.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render against `vars`. Unresolved placeholders are an error, never
    /// left in the output.
    pub fn render(&self, vars: &TemplateVars) -> PolicyResult<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => {
                    let value = vars.get(key).ok_or_else(|| {
                        PolicyError::template(format!(
                            "unresolved placeholder '({key})' in '{}'",
                            self.source
                        ))
                    })?;
                    if value.chars().any(char::is_control) {
                        return Err(PolicyError::template(format!(
                            "value for '({key})' contains control characters"
                        )));
                    }
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Variables available to a template, in precedence order: account metadata
/// first, then built-in fields.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    metadata: Option<&'a BTreeMap<String, String>>,
    builtins: BTreeMap<&'static str, String>,
}

impl<'a> TemplateVars<'a> {
    pub fn new(metadata: &'a BTreeMap<String, String>) -> Self {
        Self {
            metadata: Some(metadata),
            builtins: BTreeMap::new(),
        }
    }

    pub fn with_builtin(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.builtins.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata
            .and_then(|m| m.get(key))
            .or_else(|| self.builtins.get(key))
            .map(String::as_str)
    }
}
