//! Resource-pattern matching (spec §3 "Resource pattern", §9 Open Question (b)).
//!
//! `*` matches any run of characters except `/`; `**` matches any run
//! including `/`; anything else matches literally. Resources are
//! canonicalized to forward slashes before matching so the same patterns
//! work for file paths on any platform and for URL-shaped resources.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A compiled glob-style resource pattern.
///
/// Cheap to clone: the compiled [`Regex`] is reference-counted internally by
/// the `regex` crate's own arena, but we keep the source string around for
/// serialization and debugging since `Regex` itself isn't `Serialize`.
#[derive(Clone)]
pub struct ResourcePattern {
    source: String,
    regex: Regex,
}

impl ResourcePattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, String> {
        let source = pattern.into();
        let canonical = canonicalize(&source);
        let regex_src = translate(&canonical);
        let regex = Regex::new(&regex_src)
            .map_err(|e| format!("invalid resource pattern '{}': {}", source, e))?;
        Ok(Self { source, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match against the full canonicalized resource string (spec §4.2).
    pub fn matches(&self, resource: &str) -> bool {
        let canonical = canonicalize(resource);
        self.regex.is_match(&canonical)
    }
}

impl fmt::Debug for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePattern")
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for ResourcePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}
impl Eq for ResourcePattern {}

impl std::hash::Hash for ResourcePattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl Serialize for ResourcePattern {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for ResourcePattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ResourcePattern::new(s).map_err(serde::de::Error::custom)
    }
}

/// Canonicalize to forward-slash separators (spec §9 Open Question (b)).
pub fn canonicalize(resource: &str) -> String {
    resource.replace('\\', "/")
}

/// Translate a glob pattern into an anchored regex source string.
fn translate(pattern: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '*' {
            if chars.get(i + 1) == Some(&'*') {
                out.push_str(".*");
                i += 2;
            } else {
                out.push_str("[^/]*");
                i += 1;
            }
        } else {
            out.push_str(&regex::escape(&c.to_string()));
            i += 1;
        }
    }
    out.push('$');
    out
}
