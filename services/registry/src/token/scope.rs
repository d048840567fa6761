use std::fmt;
use std::str::FromStr;

use harbor_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Resource type of repositories.
pub const REPOSITORY: &str = "repository";

/// Resource type of registry wide resources such as the catalog.
pub const REGISTRY: &str = "registry";

/// A requested or granted `(type, name, actions)` tuple.
///
/// Serialized as an entry of the token's `access` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    /// `repository` or `registry`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Repository path, or `catalog`.
    pub name: String,
    /// `pull`, `push`, `delete` or `*`.
    pub actions: Vec<String>,
}

impl Access {
    /// Access to a repository.
    pub fn repository(name: impl Into<String>, actions: &[&str]) -> Self {
        Access {
            resource_type: REPOSITORY.into(),
            name: name.into(),
            actions: actions.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    /// Access to the catalog.
    pub fn catalog() -> Self {
        Access {
            resource_type: REGISTRY.into(),
            name: "catalog".into(),
            actions: vec!["*".into()],
        }
    }

    /// Whether this grant allows `action` on `(resource_type, name)`.
    pub fn allows(&self, resource_type: &str, name: &str, action: &str) -> bool {
        self.resource_type == resource_type
            && self.name == name
            && self.actions.iter().any(|a| a == action || a == "*")
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.name,
            self.actions.join(",")
        )
    }
}

impl FromStr for Access {
    type Err = Error;

    /// Parse `type:name:actions`. The name may itself contain `:`, as in
    /// `repository:host:5000/foo:pull`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::invalid(format!("invalid scope {s:?}")).with_code("BAD_REQUEST");
        let (resource_type, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (name, actions) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if resource_type.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Access {
            resource_type: resource_type.to_owned(),
            name: name.to_owned(),
            actions: actions
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_owned)
                .collect(),
        })
    }
}

/// Parse every `scope` parameter; each may hold several space separated
/// scopes.
pub fn parse_scopes<'a, I>(params: I) -> Result<Vec<Access>>
where
    I: IntoIterator<Item = &'a str>,
{
    params
        .into_iter()
        .flat_map(str::split_whitespace)
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_may_contain_colons() {
        let access: Access = "repository:host:5000/foo:pull,push".parse().unwrap();
        assert_eq!(access.resource_type, "repository");
        assert_eq!(access.name, "host:5000/foo");
        assert_eq!(access.actions, vec!["pull", "push"]);
    }

    #[test]
    fn repeated_and_space_separated() {
        let scopes = parse_scopes([
            "repository:lib/web:pull registry:catalog:*",
            "repository:lib/db:push",
        ])
        .unwrap();
        assert_eq!(scopes.len(), 3);
        assert_eq!(scopes[1], Access::catalog());
        assert_eq!(scopes[2].to_string(), "repository:lib/db:push");
    }

    #[test]
    fn malformed_scopes() {
        assert!("repository".parse::<Access>().is_err());
        assert!("repository:pull".parse::<Access>().is_err());
        assert!(":lib/web:pull".parse::<Access>().is_err());
    }

    #[test]
    fn wildcard_covers_everything() {
        let access = Access::repository("lib/web", &["*"]);
        assert!(access.allows(REPOSITORY, "lib/web", "delete"));
        assert!(!access.allows(REPOSITORY, "lib/db", "pull"));
    }
}
