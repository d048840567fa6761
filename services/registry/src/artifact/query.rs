//! The `q` parameter of artifact listings.
//!
//! A comma separated list of `key=value` (exact) or `key=~value` (substring)
//! terms, all of which must match. `tags=*` keeps tagged artifacts and
//! `tags=nil` untagged ones.

use std::str::FromStr;

use harbor_core::model::Artifact;
use harbor_core::{Error, Result};

const KEYS: &[&str] = &["digest", "type", "media_type", "tags", "labels"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Exact(String),
    Fuzzy(String),
}

impl Matcher {
    fn matches(&self, candidate: &str) -> bool {
        match self {
            Matcher::Exact(value) => candidate == value,
            Matcher::Fuzzy(value) => candidate.contains(value.as_str()),
        }
    }
}

/// A parsed artifact filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactQuery {
    terms: Vec<(String, Matcher)>,
}

impl FromStr for ArtifactQuery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| Error::invalid(format!("invalid query term {term:?}")))?;
            let key = key.trim();
            if !KEYS.contains(&key) {
                return Err(Error::invalid(format!("unsupported query key {key:?}")));
            }
            let matcher = match value.strip_prefix('~') {
                Some(fuzzy) => Matcher::Fuzzy(fuzzy.to_owned()),
                None => Matcher::Exact(value.to_owned()),
            };
            terms.push((key.to_owned(), matcher));
        }
        Ok(ArtifactQuery { terms })
    }
}

impl ArtifactQuery {
    /// Whether the query has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Whether `artifact`, with its tag and label names, passes every term.
    pub fn matches(&self, artifact: &Artifact, tags: &[String], labels: &[String]) -> bool {
        self.terms.iter().all(|(key, matcher)| match key.as_str() {
            "digest" => matcher.matches(&artifact.digest.to_string()),
            "type" => matcher.matches(&artifact.artifact_type.to_string()),
            "media_type" => matcher.matches(&artifact.media_type),
            "tags" => match matcher {
                Matcher::Exact(value) if value == "*" => !tags.is_empty(),
                Matcher::Exact(value) if value == "nil" => tags.is_empty(),
                _ => tags.iter().any(|tag| matcher.matches(tag)),
            },
            "labels" => labels.iter().any(|label| matcher.matches(label)),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use harbor_core::model::ArtifactType;
    use harbor_core::Digest;

    fn artifact() -> Artifact {
        Artifact {
            id: 1,
            project_id: 1,
            repository_id: 1,
            repository_name: "lib/web".into(),
            digest: Digest::sha256(b"web"),
            manifest_media_type: harbor_core::media::OCI_MANIFEST.into(),
            media_type: harbor_core::media::OCI_CONFIG.into(),
            artifact_type: ArtifactType::Image,
            size: 10,
            icon: None,
            annotations: Default::default(),
            extra_attrs: serde_json::Value::Null,
            push_time: Utc::now(),
            pull_time: None,
            pull_count: 0,
        }
    }

    #[test]
    fn exact_and_fuzzy_terms() {
        let tags = vec!["release-1".to_owned()];
        let query: ArtifactQuery = "type=IMAGE,tags=~release".parse().unwrap();
        assert!(query.matches(&artifact(), &tags, &[]));

        let query: ArtifactQuery = "tags=release".parse().unwrap();
        assert!(!query.matches(&artifact(), &tags, &[]));
    }

    #[test]
    fn tagged_and_untagged() {
        let tagged: ArtifactQuery = "tags=*".parse().unwrap();
        let untagged: ArtifactQuery = "tags=nil".parse().unwrap();
        assert!(tagged.matches(&artifact(), &["v1".into()], &[]));
        assert!(untagged.matches(&artifact(), &[], &[]));
        assert!(!untagged.matches(&artifact(), &["v1".into()], &[]));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!("owner=me".parse::<ArtifactQuery>().is_err());
        assert!("digest".parse::<ArtifactQuery>().is_err());
        assert!("".parse::<ArtifactQuery>().unwrap().is_empty());
    }
}
