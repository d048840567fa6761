//! Registry authentication: Basic credentials and the Bearer token
//! challenge flow used by Distribution registries.
//!
//! A request is first sent with whatever authorization is cached for its
//! scope. A `401` carries a `WWW-Authenticate` challenge; for `Bearer` the
//! [`Authenticator`] fetches a token from the realm, caches it under the scope
//! and the request is repeated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use harbor_core::identity::Credentials;
use harbor_core::Secret;
use http::{HeaderValue, Method, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use url::Url;

use crate::error::{ClientError, StatusError};
use crate::transport::{collect, empty, Transport};

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(10);

/// Lifetime assumed when a token response has no `expires_in`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Authentication scheme of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// HTTP Basic.
    Basic,
    /// Distribution bearer tokens.
    Bearer,
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Scheme.
    pub scheme: Scheme,
    /// Parameters, keys lower-cased.
    pub params: BTreeMap<String, String>,
}

impl Challenge {
    /// Parse a header value such as
    /// `Bearer realm="https://h/service/token",service="harbor-registry",scope="repository:a/b:pull,push"`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        let scheme = if scheme.eq_ignore_ascii_case("bearer") {
            Scheme::Bearer
        } else if scheme.eq_ignore_ascii_case("basic") {
            Scheme::Basic
        } else {
            return None;
        };
        Some(Challenge {
            scheme,
            params: parse_params(rest),
        })
    }

    /// The `realm` parameter.
    pub fn realm(&self) -> Option<&str> {
        self.params.get("realm").map(String::as_str)
    }

    /// The `service` parameter.
    pub fn service(&self) -> Option<&str> {
        self.params.get("service").map(String::as_str)
    }

    /// The `scope` parameter.
    pub fn scope(&self) -> Option<&str> {
        self.params.get("scope").map(String::as_str)
    }
}

/// Split `key="value",key=value` pairs. Commas inside quotes belong to the
/// value.
fn parse_params(input: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                match c {
                    '\\' if !escaped => escaped = true,
                    '"' if !escaped => break,
                    c => {
                        value.push(c);
                        escaped = false;
                    }
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }
    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: Secret,
    expires: Instant,
}

/// Credentials plus a per-scope token cache for one registry.
#[derive(Debug)]
pub struct Authenticator {
    credential: Option<(String, Secret)>,
    tokens: DashMap<String, CachedToken>,
    basic: AtomicBool,
    strip_catalog_scope: bool,
}

impl Authenticator {
    /// Authenticate with `credential`, or anonymously.
    pub fn new(credential: Option<(String, Secret)>) -> Self {
        Authenticator {
            credential,
            tokens: DashMap::new(),
            basic: AtomicBool::new(false),
            strip_catalog_scope: false,
        }
    }

    /// Request catalog tokens without a scope. Some registries reject the
    /// `registry:catalog:*` scope but list repositories for any valid token.
    pub fn strip_catalog_scope(mut self, strip: bool) -> Self {
        self.strip_catalog_scope = strip;
        self
    }

    /// Send Basic credentials before any challenge. Token responses still
    /// take precedence once cached.
    pub fn preemptive_basic(self, enabled: bool) -> Self {
        self.basic
            .store(enabled && self.credential.is_some(), Ordering::Relaxed);
        self
    }

    /// Whether credentials are configured.
    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    fn basic_header(&self) -> Option<HeaderValue> {
        self.credential
            .as_ref()
            .and_then(|(username, password)| Credentials::to_basic_header(username, password))
    }

    /// Authorization for a request needing `scope`, if any is known.
    pub fn authorization(&self, scope: &str) -> Option<HeaderValue> {
        if let Some(cached) = self.tokens.get(scope) {
            if cached.expires > Instant::now() {
                let mut header = cached.token.bearer().ok()?;
                header.set_sensitive(true);
                return Some(header);
            }
        }
        if self.basic.load(Ordering::Relaxed) {
            return self.basic_header();
        }
        None
    }

    /// Cache a token obtained outside the challenge flow, such as from a
    /// vendor login endpoint.
    pub fn insert_token(&self, scope: &str, token: Secret, ttl: Duration) {
        self.tokens.insert(
            scope.to_owned(),
            CachedToken {
                token,
                expires: Instant::now() + ttl.saturating_sub(EXPIRY_MARGIN),
            },
        );
    }

    /// Forget the token of `scope`.
    pub fn invalidate(&self, scope: &str) {
        self.tokens.remove(scope);
    }

    /// Satisfy a challenge for `scope`. Returns false if nothing changed, in
    /// which case repeating the request is pointless.
    #[tracing::instrument(skip(self, transport, challenge))]
    pub async fn respond(
        &self,
        transport: &dyn Transport,
        challenge: &Challenge,
        scope: &str,
    ) -> Result<bool, ClientError> {
        match challenge.scheme {
            Scheme::Basic => {
                if self.credential.is_none() || self.basic.swap(true, Ordering::Relaxed) {
                    return Ok(false);
                }
                Ok(true)
            }
            Scheme::Bearer => {
                let token = self.fetch_token(transport, challenge, scope).await?;
                self.tokens.insert(scope.to_owned(), token);
                Ok(true)
            }
        }
    }

    async fn fetch_token(
        &self,
        transport: &dyn Transport,
        challenge: &Challenge,
        scope: &str,
    ) -> Result<CachedToken, ClientError> {
        let realm = challenge
            .realm()
            .ok_or_else(|| ClientError::Auth("bearer challenge without realm".into()))?;
        let mut url = Url::parse(realm)
            .map_err(|err| ClientError::Auth(format!("invalid token realm {realm:?}: {err}")))?;

        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = challenge.service() {
                query.append_pair("service", service);
            }
            let requested = challenge.scope().unwrap_or(scope);
            let catalog = requested.starts_with("registry:catalog:");
            if !requested.is_empty() && !(catalog && self.strip_catalog_scope) {
                for part in requested.split(' ') {
                    query.append_pair("scope", part);
                }
            }
        }

        let mut request = http::Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(http::header::ACCEPT, "application/json");
        if let Some(basic) = self.basic_header() {
            request = request.header(http::header::AUTHORIZATION, basic);
        }
        let request = request
            .body(empty())
            .map_err(|err| ClientError::InvalidRequest(err.to_string()))?;

        tracing::debug!(realm = %url.origin().ascii_serialization(), "Requesting registry token");
        let response = transport.send(request).await?;
        let (parts, body) = response.into_parts();
        let body = collect(body).await?;

        if parts.status != StatusCode::OK {
            let status =
                StatusError::new(Method::GET, realm, parts.status, &parts.headers, &body);
            return Err(match parts.status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ClientError::Auth(status.to_string())
                }
                _ => ClientError::Status(status),
            });
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| ClientError::InvalidResponse(format!("token response: {err}")))?;
        let token = parsed
            .token
            .or(parsed.access_token)
            .ok_or_else(|| ClientError::InvalidResponse("token response without token".into()))?;
        let ttl = parsed
            .expires_in
            .map_or(DEFAULT_TOKEN_TTL, Duration::from_secs)
            .saturating_sub(EXPIRY_MARGIN);

        Ok(CachedToken {
            token: Secret::new(token),
            expires: Instant::now() + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockTransport};

    #[test]
    fn parses_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://h/service/token",service="harbor-registry",scope="repository:library/nginx:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, Scheme::Bearer);
        assert_eq!(challenge.realm(), Some("https://h/service/token"));
        assert_eq!(challenge.service(), Some("harbor-registry"));
        assert_eq!(challenge.scope(), Some("repository:library/nginx:pull,push"));
    }

    #[test]
    fn parses_basic_challenge() {
        let challenge = Challenge::parse(r#"Basic realm="registry""#).unwrap();
        assert_eq!(challenge.scheme, Scheme::Basic);
        assert!(Challenge::parse("Negotiate abc").is_none());
    }

    #[tokio::test]
    async fn caches_tokens_per_scope() {
        let mock = MockTransport::new();
        mock.on(Method::GET, "/service/token", |request| {
            assert!(request.header("authorization").unwrap().starts_with("Basic "));
            assert_eq!(request.query("service").as_deref(), Some("svc"));
            MockResponse::ok().json(&serde_json::json!({"token": "abc", "expires_in": 300}))
        });

        let auth = Authenticator::new(Some(("admin".into(), Secret::new("pw"))));
        let challenge = Challenge::parse(
            r#"Bearer realm="https://h/service/token",service="svc",scope="repository:a/b:pull""#,
        )
        .unwrap();

        assert!(auth.authorization("repository:a/b:pull").is_none());
        assert!(auth
            .respond(&mock, &challenge, "repository:a/b:pull")
            .await
            .unwrap());
        let header = auth.authorization("repository:a/b:pull").unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer abc");
        assert!(auth.authorization("repository:c/d:pull").is_none());
    }

    #[tokio::test]
    async fn strips_catalog_scope_when_asked() {
        let mock = MockTransport::new();
        mock.on(Method::GET, "/token", |request| {
            assert_eq!(request.query("scope"), None);
            MockResponse::ok().json(&serde_json::json!({"access_token": "xyz"}))
        });

        let auth = Authenticator::new(None).strip_catalog_scope(true);
        let challenge = Challenge::parse(r#"Bearer realm="https://q/token",service="quay""#).unwrap();
        auth.respond(&mock, &challenge, "registry:catalog:*")
            .await
            .unwrap();
        assert!(auth.authorization("registry:catalog:*").is_some());
    }

    #[tokio::test]
    async fn rejected_credentials_are_auth_errors() {
        let mock = MockTransport::new();
        mock.respond(
            Method::GET,
            "/token",
            MockResponse::new(StatusCode::UNAUTHORIZED),
        );
        let auth = Authenticator::new(Some(("u".into(), Secret::new("bad"))));
        let challenge = Challenge::parse(r#"Bearer realm="https://q/token""#).unwrap();
        let err = auth
            .respond(&mock, &challenge, "repository:a/b:pull")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }
}
