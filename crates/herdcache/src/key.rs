//! Cache keys and key templates
//!
//! A [`CacheKey`] is the resolved argument string joined with a SHA-256 of the
//! namespace tag, so equal requests always map to the same key. Templates use
//! a closed placeholder syntax: `{name}` is replaced by the named argument,
//! `{{` and `}}` are literal braces.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Immutable identifier of a cached value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build `"{resolved}:{sha256(namespace)}"`
    pub fn new(resolved: &str, namespace: &str) -> Self {
        let digest = Sha256::digest(namespace.as_bytes());
        CacheKey(format!("{}:{}", resolved, hex::encode(digest)))
    }

    /// Use an already-built key verbatim
    pub fn raw(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    /// Key as stored in the backend
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Parsed key template such as `"order:{id}:{region}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    /// Parse a template; unterminated, empty or stray braces are rejected
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(Error::Config(format!(
                                    "unterminated placeholder in key template '{}'",
                                    template
                                )))
                            }
                            Some(ch) => name.push(ch),
                        }
                    }
                    let name = name.trim().to_string();
                    if name.is_empty() {
                        return Err(Error::Config(format!(
                            "empty placeholder in key template '{}'",
                            template
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' => {
                    return Err(Error::Config(format!(
                        "unmatched '}}' in key template '{}'",
                        template
                    )))
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// Template text as given
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of the placeholders, in order of appearance
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute `args`; a missing argument renders as `"{name}:{default_if_missing}"`
    pub fn render(&self, args: &[(&str, &str)], default_if_missing: &str) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    match args.iter().find(|(k, _)| *k == name.as_str()) {
                        Some((_, value)) => out.push_str(value),
                        None => {
                            out.push_str(name);
                            out.push(':');
                            out.push_str(default_if_missing);
                        }
                    }
                }
            }
        }
        out
    }

    /// Render and combine with `namespace` into a [`CacheKey`]
    pub fn key(&self, args: &[(&str, &str)], default_if_missing: &str, namespace: &str) -> CacheKey {
        CacheKey::new(&self.render(args, default_if_missing), namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable() {
        let a = CacheKey::new("user:42", "users");
        let b = CacheKey::new("user:42", "users");
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::new("user:42", "orders"));
        assert!(a.as_str().starts_with("user:42:"));
        assert_eq!(a.as_str().len(), "user:42:".len() + 64);
    }

    #[test]
    fn test_render_with_missing_argument() {
        let template = KeyTemplate::parse("order:{id}:{region}").unwrap();
        assert_eq!(
            template.placeholders().collect::<Vec<_>>(),
            vec!["id", "region"]
        );
        assert_eq!(
            template.render(&[("id", "7"), ("region", "eu")], "none"),
            "order:7:eu"
        );
        assert_eq!(template.render(&[("id", "7")], "none"), "order:7:region:none");
    }

    #[test]
    fn test_escaped_braces() {
        let template = KeyTemplate::parse("{{raw}}:{id}").unwrap();
        assert_eq!(template.render(&[("id", "1")], "-"), "{raw}:1");
    }

    #[test]
    fn test_rejects_malformed_templates() {
        assert!(KeyTemplate::parse("user:{id").is_err());
        assert!(KeyTemplate::parse("user:{}").is_err());
        assert!(KeyTemplate::parse("user:id}").is_err());
        assert!(KeyTemplate::parse("user:{a{b}").is_err());
    }
}
