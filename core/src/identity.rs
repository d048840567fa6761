//! Authentication backends are external; the access plane only needs to
//! turn credentials into a [`Principal`].

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use base64::Engine as _;
use http::HeaderValue;

use crate::error::{Error, Result};
use crate::secret::Secret;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Login name.
    pub username: String,
    /// System administrators bypass project permissions.
    pub sysadmin: bool,
}

/// Name of [`Subject::Anonymous`] in token subjects and event operators.
pub const ANONYMOUS: &str = "anonymous";

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// No credentials were presented.
    Anonymous,
    /// Credentials were verified.
    User(Principal),
}

impl Subject {
    /// The `sub` claim for tokens issued to this subject.
    pub fn name(&self) -> &str {
        match self {
            Subject::Anonymous => ANONYMOUS,
            Subject::User(principal) => &principal.username,
        }
    }

    /// Whether this subject is a system administrator.
    pub fn is_sysadmin(&self) -> bool {
        matches!(self, Subject::User(p) if p.sysadmin)
    }

    /// The principal, unless anonymous.
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Subject::Anonymous => None,
            Subject::User(principal) => Some(principal),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Anonymous => f.write_str(ANONYMOUS),
            Subject::User(principal) => f.write_str(&principal.username),
        }
    }
}

/// Credentials presented with a request.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Nothing presented.
    Anonymous,
    /// HTTP Basic username and password.
    Basic {
        /// Login name.
        username: String,
        /// Password.
        password: Secret,
    },
}

impl Credentials {
    /// Parse an `Authorization: Basic ...` header value.
    pub fn from_basic_header(value: &HeaderValue) -> Result<Self> {
        let invalid = || Error::unauthorized("malformed basic credentials");

        let value = value.to_str().map_err(|_| invalid())?;
        let encoded = value
            .strip_prefix("Basic ")
            .or_else(|| value.strip_prefix("basic "))
            .ok_or_else(invalid)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| invalid())?;
        let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
        let (username, password) = decoded.split_once(':').ok_or_else(invalid)?;

        Ok(Credentials::Basic {
            username: username.to_owned(),
            password: Secret::new(password),
        })
    }

    /// Encode as an `Authorization` header value.
    pub fn to_basic_header(username: &str, password: &Secret) -> Option<HeaderValue> {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{username}:{}", password.revealed()));
        let mut header = HeaderValue::try_from(format!("Basic {encoded}")).ok()?;
        header.set_sensitive(true);
        Some(header)
    }
}

/// Verifies credentials against an external user database.
#[async_trait]
pub trait IdentityProvider: fmt::Debug + Send + Sync {
    /// Check a username and password.
    async fn authenticate(&self, username: &str, password: &Secret) -> Result<Principal>;

    /// Look up a user that authenticated earlier (refresh tokens).
    async fn lookup(&self, username: &str) -> Result<Principal>;

    /// Resolve credentials into a subject. Anonymous credentials always succeed.
    async fn resolve(&self, credentials: &Credentials) -> Result<Subject> {
        match credentials {
            Credentials::Anonymous => Ok(Subject::Anonymous),
            Credentials::Basic { username, password } => self
                .authenticate(username, password)
                .await
                .map(Subject::User),
        }
    }
}

/// A fixed set of users, for tests and single-tenant deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    users: HashMap<String, (Secret, Principal)>,
}

impl StaticIdentityProvider {
    /// An empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user.
    pub fn user(mut self, username: &str, password: &str, sysadmin: bool) -> Self {
        self.users.insert(
            username.to_owned(),
            (
                Secret::new(password),
                Principal {
                    username: username.to_owned(),
                    sysadmin,
                },
            ),
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, username: &str, password: &Secret) -> Result<Principal> {
        match self.users.get(username) {
            Some((expected, principal)) if expected == password => Ok(principal.clone()),
            _ => Err(Error::unauthorized("invalid username or password")),
        }
    }

    async fn lookup(&self, username: &str) -> Result<Principal> {
        self.users
            .get(username)
            .map(|(_, principal)| principal.clone())
            .ok_or_else(|| Error::unauthorized(format!("unknown user {username}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header_round_trip() {
        let header = Credentials::to_basic_header("admin", &Secret::new("Harbor12345")).unwrap();
        match Credentials::from_basic_header(&header).unwrap() {
            Credentials::Basic { username, password } => {
                assert_eq!(username, "admin");
                assert_eq!(password.revealed(), "Harbor12345");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_basic_header() {
        let header = HeaderValue::from_static("Basic !!!");
        let err = Credentials::from_basic_header(&header).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn static_provider() {
        let idp = StaticIdentityProvider::new().user("admin", "pw", true);
        let subject = idp
            .resolve(&Credentials::Basic {
                username: "admin".into(),
                password: Secret::new("pw"),
            })
            .await
            .unwrap();
        assert!(subject.is_sysadmin());

        let err = idp
            .authenticate("admin", &Secret::new("wrong"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unauthorized);
        assert_eq!(
            idp.resolve(&Credentials::Anonymous).await.unwrap(),
            Subject::Anonymous
        );        assert_eq!(Subject::Anonymous.name(), "anonymous");
    }
}
