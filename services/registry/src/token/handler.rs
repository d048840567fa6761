//! The token endpoint.
//!
//! `GET` follows the Docker token protocol: Basic credentials (or none), a
//! `service` and any number of `scope` parameters. `POST` is the OAuth2
//! form flow with `grant_type=password` or `grant_type=refresh_token`.

use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use harbor_core::identity::{Credentials, Subject};
use harbor_core::{Error, Secret};
use serde::Serialize;
use serde_json::Value;
use url::form_urlencoded;

use super::{parse_scopes, Access};
use crate::api::AppState;
use crate::error::{RegistryError, RegistryResult};

/// Routes for the token endpoint mounted at `path`, and its key set at
/// `{path}/keys`.
pub(crate) fn router(path: &str) -> Router<AppState> {
    let path = path.trim_end_matches('/');
    Router::new()
        .route(path, get(get_token).post(post_token))
        .route(&format!("{path}/keys"), get(keys))
}

#[derive(Debug, Default)]
struct TokenRequest {
    service: Option<String>,
    scopes: Vec<String>,
    offline: bool,
    grant_type: Option<String>,
    username: Option<String>,
    password: Option<String>,
    refresh_token: Option<String>,
}

impl TokenRequest {
    fn parse(input: &[u8]) -> Self {
        let mut request = TokenRequest::default();
        for (key, value) in form_urlencoded::parse(input) {
            match key.as_ref() {
                "service" => request.service = Some(value.into_owned()),
                "scope" => request.scopes.push(value.into_owned()),
                "offline_token" => request.offline |= value == "true",
                "access_type" => request.offline |= value == "offline",
                "grant_type" => request.grant_type = Some(value.into_owned()),
                "username" => request.username = Some(value.into_owned()),
                "password" => request.password = Some(value.into_owned()),
                "refresh_token" => request.refresh_token = Some(value.into_owned()),
                _ => {}
            }
        }
        request
    }
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
    access_token: String,
    expires_in: u64,
    issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

/// A token endpoint failure. Authentication failures carry a Basic
/// challenge pointing back at the realm.
#[derive(Debug)]
struct TokenError {
    error: RegistryError,
    realm: String,
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let challenge = self.error.status_code() == StatusCode::UNAUTHORIZED;
        let mut response = self.error.into_response();
        if challenge {
            if let Ok(value) = HeaderValue::try_from(format!("Basic realm=\"{}\"", self.realm)) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

async fn get_token(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, TokenError> {
    let request = TokenRequest::parse(query.unwrap_or_default().as_bytes());
    basic_grant(&state, &request, &headers)
        .await
        .map_err(|error| state.token_error(error))
}

async fn post_token(State(state): State<AppState>, body: Bytes) -> Result<Json<TokenResponse>, TokenError> {
    let request = TokenRequest::parse(&body);
    form_grant(&state, &request)
        .await
        .map_err(|error| state.token_error(error))
}

async fn basic_grant(state: &AppState, request: &TokenRequest, headers: &HeaderMap) -> RegistryResult<Json<TokenResponse>> {
    let credentials = match headers.get(header::AUTHORIZATION) {
        Some(value) => Credentials::from_basic_header(value)?,
        None => Credentials::Anonymous,
    };
    let subject = state.identity.resolve(&credentials).await?;
    issue(state, request, &subject).await
}

async fn form_grant(state: &AppState, request: &TokenRequest) -> RegistryResult<Json<TokenResponse>> {
    let subject = match request.grant_type.as_deref() {
        Some("password") => {
            let username = request.username.as_deref().unwrap_or_default();
            let password = Secret::new(request.password.as_deref().unwrap_or_default());
            Subject::User(state.identity.authenticate(username, &password).await?)
        }
        Some("refresh_token") => {
            let token = request
                .refresh_token
                .as_deref()
                .ok_or_else(|| Error::unauthorized("missing refresh_token"))?;
            let username = state.tokens.verify_refresh(token)?;
            Subject::User(state.identity.lookup(&username).await?)
        }
        other => {
            return Err(Error::invalid(format!(
                "unsupported grant_type {}",
                other.unwrap_or("(none)")
            ))
            .into())
        }
    };
    issue(state, request, &subject).await
}

async fn issue(state: &AppState, request: &TokenRequest, subject: &Subject) -> RegistryResult<Json<TokenResponse>> {
    if let Some(service) = &request.service {
        if service != &state.config.token.service {
            return Err(Error::invalid(format!("unknown service {service:?}")).into());
        }
    }
    let requested = parse_scopes(request.scopes.iter().map(String::as_str))?;
    let mut granted: Vec<Access> = Vec::with_capacity(requested.len());
    for access in &requested {
        if let Some(access) = state.access.grant(subject, access).await? {
            granted.push(access);
        }
    }
    tracing::debug!(
        subject = %subject,
        requested = requested.len(),
        granted = granted.len(),
        "Issuing token"
    );
    let issued = state.tokens.issue(subject, granted)?;
    let refresh_token = match (request.offline, subject.principal()) {
        (true, Some(_)) => Some(state.tokens.issue_refresh(subject)?.token),
        _ => None,
    };
    Ok(Json(TokenResponse {
        access_token: issued.token.clone(),
        token: issued.token,
        expires_in: issued.expires_in,
        issued_at: issued.issued_at,
        refresh_token,
    }))
}

async fn keys(State(state): State<AppState>) -> Json<Value> {
    Json(state.tokens.jwks())
}

impl crate::api::Services {
    fn token_error(&self, error: RegistryError) -> TokenError {
        TokenError {
            error,
            realm: self.config.token.realm.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_scopes_are_collected() {
        let request = TokenRequest::parse(
            b"service=harbor-registry&scope=repository%3Alib%2Fweb%3Apull&scope=registry%3Acatalog%3A*&offline_token=true",
        );
        assert_eq!(request.service.as_deref(), Some("harbor-registry"));
        assert_eq!(
            request.scopes,
            vec!["repository:lib/web:pull", "registry:catalog:*"]
        );
        assert!(request.offline);
    }

    #[test]
    fn oauth_form_fields() {
        let request =
            TokenRequest::parse(b"grant_type=password&username=admin&password=p%40ss&access_type=offline");
        assert_eq!(request.grant_type.as_deref(), Some("password"));
        assert_eq!(request.password.as_deref(), Some("p@ss"));
        assert!(request.offline);
    }
}
