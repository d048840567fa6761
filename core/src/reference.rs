//! Repository names and manifest references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Result};

/// Maximum length of a full repository path.
pub const MAX_REPOSITORY_LENGTH: usize = 255;

/// Maximum length of a tag.
pub const MAX_TAG_LENGTH: usize = 128;

/// A validated repository path of the form `project/name[/sub/path]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Validate and wrap a repository path.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_repository(&name)?;
        Ok(RepositoryName(name))
    }

    /// Name of the owning project (first path component).
    pub fn project(&self) -> &str {
        self.0.split_once('/').map(|(p, _)| p).unwrap_or(&self.0)
    }

    /// Path of the repository inside its project.
    pub fn within_project(&self) -> &str {
        self.0.split_once('/').map(|(_, r)| r).unwrap_or("")
    }

    /// The full path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryName({})", self.0)
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RepositoryName::new(s)
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        RepositoryName::new(value)
    }
}

impl From<RepositoryName> for String {
    fn from(name: RepositoryName) -> Self {
        name.0
    }
}

/// Validate a repository path against the Distribution grammar.
///
/// Components are lower-case alphanumerics separated by `.`, `_`, `__` or
/// runs of `-`, joined with `/`. The path must contain a project and a name.
pub fn validate_repository(name: &str) -> Result<()> {
    let invalid = || Error::invalid(format!("invalid repository name {name:?}")).with_code("NAME_INVALID");

    if name.is_empty() || name.len() > MAX_REPOSITORY_LENGTH || !name.contains('/') {
        return Err(invalid());
    }

    for component in name.split('/') {
        if !valid_component(component) {
            return Err(invalid());
        }
    }
    Ok(())
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) if alnum(first) && alnum(last) => {}
        _ => return false,
    }

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if alnum(b) {
            i += 1;
            continue;
        }
        let separator_len = match b {
            b'.' => 1,
            b'_' if bytes.get(i + 1) == Some(&b'_') => 2,
            b'_' => 1,
            b'-' => bytes[i..].iter().take_while(|&&c| c == b'-').count(),
            _ => return false,
        };
        i += separator_len;
        if !bytes.get(i).copied().is_some_and(alnum) {
            return false;
        }
    }
    true
}

/// Validate a tag name: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<()> {
    let mut bytes = tag.bytes();
    let valid = match bytes.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == b'_' => {
            tag.len() <= MAX_TAG_LENGTH
                && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::invalid(format!("invalid tag {tag:?}")).with_code("TAG_INVALID"))
    }
}

/// A manifest reference: either a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable tag.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// The tag, if this is a tag reference.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }

    /// The digest, if this is a digest reference.
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Reference::Tag(_) => None,
            Reference::Digest(digest) => Some(digest),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => digest.fmt(f),
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains(':') {
            Ok(Reference::Digest(s.parse()?))
        } else {
            validate_tag(s)?;
            Ok(Reference::Tag(s.to_owned()))
        }
    }
}

impl From<Digest> for Reference {
    fn from(digest: Digest) -> Self {
        Reference::Digest(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        for ok in ["library/nginx", "p/web", "a/b/c-d", "a/b__c", "a1/b.c", "a/b---c"] {
            assert!(validate_repository(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["nginx", "Library/nginx", "a//b", "a/-b", "a/b-", "a/b..c", "/a", "a/b_"] {
            assert!(validate_repository(bad).is_err(), "{bad} should be invalid");
        }
    }

    #[test]
    fn project_split() {
        let name = RepositoryName::new("library/sub/nginx").unwrap();
        assert_eq!(name.project(), "library");
        assert_eq!(name.within_project(), "sub/nginx");
    }

    #[test]
    fn tags() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("_v1.0-rc").is_ok());
        assert!(validate_tag(&"a".repeat(128)).is_ok());
        assert!(validate_tag(&"a".repeat(129)).is_err());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag("-x").is_err());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("a/b").is_err());
    }

    #[test]
    fn references() {
        assert_eq!(
            "latest".parse::<Reference>().unwrap(),
            Reference::Tag("latest".into())
        );
        let digest = Digest::sha256(b"x");
        assert_eq!(
            digest.to_string().parse::<Reference>().unwrap(),
            Reference::Digest(digest)
        );
        assert!("sha256:nothex".parse::<Reference>().is_err());
    }
}
