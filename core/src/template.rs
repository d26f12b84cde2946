//! `$variable` prompt templates.
//!
//! Stored prompt templates use dollar-sign placeholders: `$name` or
//! `${name}`, with `$$` as a literal dollar escape. Identifiers are
//! ASCII: a letter or underscore followed by letters, digits, or
//! underscores.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid placeholder at byte {position}")]
    InvalidPlaceholder { position: usize },

    #[error("missing value for variable '{name}'")]
    MissingVariable { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
}

enum Segment<'a> {
    Literal(&'a str),
    Dollar,
    Variable(&'a str),
}

impl Template {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True when every `$` in the template starts a well-formed
    /// placeholder or escape.
    pub fn is_valid(&self) -> bool {
        self.segments().is_ok()
    }

    /// The distinct variable names used by this template, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        if let Ok(segments) = self.segments() {
            for segment in segments {
                if let Segment::Variable(name) = segment {
                    names.insert(name.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    /// Substitute every placeholder from `vars`. Fails on a malformed
    /// template or a variable with no supplied value.
    pub fn substitute(&self, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in self.segments()? {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Dollar => out.push('$'),
                Segment::Variable(name) => {
                    let value = vars.get(name).ok_or_else(|| TemplateError::MissingVariable {
                        name: name.to_string(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    fn segments(&self) -> Result<Vec<Segment<'_>>, TemplateError> {
        let bytes = self.raw.as_bytes();
        let mut segments = Vec::new();
        let mut literal_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'$' {
                i += 1;
                continue;
            }
            if literal_start < i {
                segments.push(Segment::Literal(&self.raw[literal_start..i]));
            }
            let rest = &bytes[i + 1..];
            match rest.first() {
                Some(b'$') => {
                    segments.push(Segment::Dollar);
                    i += 2;
                }
                Some(b'{') => {
                    let name_len = identifier_len(&rest[1..]);
                    if name_len == 0 || rest.get(1 + name_len) != Some(&b'}') {
                        return Err(TemplateError::InvalidPlaceholder { position: i });
                    }
                    segments.push(Segment::Variable(&self.raw[i + 2..i + 2 + name_len]));
                    i += name_len + 3;
                }
                _ => {
                    let name_len = identifier_len(rest);
                    if name_len == 0 {
                        return Err(TemplateError::InvalidPlaceholder { position: i });
                    }
                    segments.push(Segment::Variable(&self.raw[i + 1..i + 1 + name_len]));
                    i += name_len + 1;
                }
            }
            literal_start = i;
        }
        if literal_start < bytes.len() {
            segments.push(Segment::Literal(&self.raw[literal_start..]));
        }
        Ok(segments)
    }
}

fn identifier_len(bytes: &[u8]) -> usize {
    let mut len = 0;
    for (idx, b) in bytes.iter().enumerate() {
        let valid = if idx == 0 {
            b.is_ascii_alphabetic() || *b == b'_'
        } else {
            b.is_ascii_alphanumeric() || *b == b'_'
        };
        if !valid {
            break;
        }
        len = idx + 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identifiers_are_sorted_and_distinct() {
        let t = Template::new("Process $chapter for $name; again, $name in ${chapter}.");
        assert_eq!(t.identifiers(), vec!["chapter", "name"]);
    }

    #[test]
    fn substitutes_both_placeholder_forms() {
        let t = Template::new("Read ${slug} by $author");
        let out = t
            .substitute(&vars(&[("slug", "rivendell"), ("author", "Bilbo")]))
            .unwrap();
        assert_eq!(out, "Read rivendell by Bilbo");
    }

    #[test]
    fn dollar_escape_is_literal() {
        let t = Template::new("Costs $$5 for $item");
        assert!(t.is_valid());
        let out = t.substitute(&vars(&[("item", "bread")])).unwrap();
        assert_eq!(out, "Costs $5 for bread");
    }

    #[test]
    fn bare_dollar_is_invalid() {
        assert!(!Template::new("a lone $ sign").is_valid());
        assert!(!Template::new("trailing $").is_valid());
        assert!(!Template::new("unclosed ${name").is_valid());
        assert!(!Template::new("empty ${}").is_valid());
    }

    #[test]
    fn missing_variable_is_an_error() {
        let t = Template::new("hello $name");
        let err = t.substitute(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingVariable { .. }));
    }

    #[test]
    fn template_without_placeholders_passes_through() {
        let t = Template::new("no placeholders at all");
        assert!(t.is_valid());
        assert!(t.identifiers().is_empty());
        assert_eq!(
            t.substitute(&BTreeMap::new()).unwrap(),
            "no placeholders at all"
        );
    }
}
