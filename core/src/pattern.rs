//! Doublestar patterns used by filters, immutability and retention rules.
//!
//! `*` matches within a path component, `**` crosses `/`, `?` matches one
//! character and `{a,b}` expands to alternatives. An empty pattern matches
//! everything.

use std::fmt;

use glob::MatchOptions;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A compiled doublestar pattern.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    raw: String,
    alternatives: Vec<glob::Pattern>,
}

impl Pattern {
    /// Compile `raw`, expanding brace alternatives.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let alternatives = if raw.is_empty() {
            Vec::new()
        } else {
            expand_braces(&raw)?
                .iter()
                .map(|alt| {
                    glob::Pattern::new(alt).map_err(|err| {
                        Error::invalid(format!("invalid pattern {raw:?}")).with_source(err)
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Pattern { raw, alternatives })
    }

    /// A pattern which matches any input.
    pub fn any() -> Self {
        Pattern {
            raw: String::new(),
            alternatives: Vec::new(),
        }
    }

    /// Whether `candidate` matches any alternative.
    pub fn matches(&self, candidate: &str) -> bool {
        self.alternatives.is_empty()
            || self
                .alternatives
                .iter()
                .any(|p| p.matches_with(candidate, OPTIONS))
    }

    /// The source text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.raw)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Pattern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Pattern::new(value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.raw
    }
}

/// Expand the first top-level `{a,b,...}` group and recurse on the results.
fn expand_braces(pattern: &str) -> Result<Vec<String>> {
    let Some(open) = pattern.find('{') else {
        return Ok(vec![pattern.to_owned()]);
    };

    let mut depth = 0usize;
    let mut close = None;
    let mut splits = Vec::new();
    for (i, c) in pattern[open..].char_indices() {
        let at = open + i;
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(at);
                    break;
                }
            }
            ',' if depth == 1 => splits.push(at),
            _ => {}
        }
    }
    let close =
        close.ok_or_else(|| Error::invalid(format!("unbalanced braces in pattern {pattern:?}")))?;

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    let mut bounds = vec![open];
    bounds.extend(splits);
    bounds.push(close);

    let mut expanded = Vec::new();
    for window in bounds.windows(2) {
        let alternative = &pattern[window[0] + 1..window[1]];
        for tail in expand_braces(&format!("{prefix}{alternative}{suffix}"))? {
            expanded.push(tail);
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_star_stays_in_component() {
        let p = Pattern::new("library/*").unwrap();
        assert!(p.matches("library/nginx"));
        assert!(!p.matches("library/sub/nginx"));
    }

    #[test]
    fn double_star_crosses_components() {
        let p = Pattern::new("library/**").unwrap();
        assert!(p.matches("library/nginx"));
        assert!(p.matches("library/sub/nginx"));
        assert!(!p.matches("other/nginx"));
    }

    #[test]
    fn braces() {
        let p = Pattern::new("{release,hotfix}-*").unwrap();
        assert!(p.matches("release-1"));
        assert!(p.matches("hotfix-2"));
        assert!(!p.matches("feature-3"));

        let nested = Pattern::new("v{1,2{a,b}}").unwrap();
        assert!(nested.matches("v1"));
        assert!(nested.matches("v2a"));
        assert!(nested.matches("v2b"));
        assert!(!nested.matches("v2"));
    }

    #[test]
    fn empty_matches_all() {
        assert!(Pattern::new("").unwrap().matches("anything/at/all"));
        assert!(Pattern::any().matches(""));
    }

    #[test]
    fn unbalanced_is_invalid() {
        assert!(Pattern::new("{a,b").is_err());
    }
}
