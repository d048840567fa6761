//! Authentication and authorization of `/v2` requests.
//!
//! Bearer tokens are checked against the access they carry. Basic
//! credentials are accepted too and evaluated against project membership
//! directly. Anonymous callers are always challenged so clients fetch a
//! token, which may still be anonymous.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use harbor_core::identity::{Credentials, Principal, Subject, ANONYMOUS};
use harbor_core::{Error, Result};

use super::route::Route;
use crate::access::{PULL, PUSH};
use crate::api::AppState;
use crate::error::RegistryError;
use crate::token::{Claims, REGISTRY, REPOSITORY};

/// The authenticated caller of a `/v2` request.
#[derive(Debug, Clone)]
pub(crate) struct Caller {
    pub(crate) subject: Subject,
    grant: Grant,
}

#[derive(Debug, Clone)]
enum Grant {
    Token(Box<Claims>),
    Direct,
}

impl Caller {
    /// Whether the caller may perform `action` on a resource.
    pub(crate) async fn may(&self, state: &AppState, resource_type: &str, name: &str, action: &str) -> Result<bool> {
        match &self.grant {
            Grant::Token(claims) => Ok(claims.allows(resource_type, name, action)),
            Grant::Direct if resource_type == REPOSITORY => {
                state.access.can(&self.subject, name, action).await
            }
            Grant::Direct => Ok(resource_type == REGISTRY && self.subject.is_sysadmin()),
        }
    }

    fn is_token(&self) -> bool {
        matches!(self.grant, Grant::Token(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Challenge {
    Missing,
    InvalidToken,
    InsufficientScope,
}

async fn identify(state: &AppState, headers: &HeaderMap) -> Result<Option<Caller>> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| Error::unauthorized("malformed authorization header"))?;
    if let Some(token) = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer ")) {
        let claims = state.tokens.verify(token.trim())?;
        let subject = if claims.sub.is_empty() || claims.sub == ANONYMOUS {
            Subject::Anonymous
        } else {
            match state.identity.lookup(&claims.sub).await {
                Ok(principal) => Subject::User(principal),
                Err(_) => Subject::User(Principal {
                    username: claims.sub.clone(),
                    sysadmin: false,
                }),
            }
        };
        return Ok(Some(Caller {
            subject,
            grant: Grant::Token(Box::new(claims)),
        }));
    }
    let credentials = Credentials::from_basic_header(value)?;
    let subject = state.identity.resolve(&credentials).await?;
    Ok(Some(Caller {
        subject,
        grant: Grant::Direct,
    }))
}

/// Resolve the [`Caller`] and check it may use the route.
pub(crate) async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<Route>()
        .cloned()
        .unwrap_or(Route::Unknown);
    if route == Route::Unknown {
        return next.run(request).await;
    }
    let method = request.method().clone();

    let caller = match identify(&state, request.headers()).await {
        Ok(Some(caller)) => caller,
        Ok(None) => return challenge(&state, &route, &method, Challenge::Missing),
        Err(err) => {
            tracing::debug!(error = %err, "Rejected credentials");
            return challenge(&state, &route, &method, Challenge::InvalidToken);
        }
    };

    if let (Some(repository), Some(action)) = (route.repository(), route.action(&method)) {
        match caller.may(&state, REPOSITORY, repository, action).await {
            Ok(true) => {}
            Ok(false) if caller.is_token() => {
                return challenge(&state, &route, &method, Challenge::InsufficientScope)
            }
            Ok(false) => {
                return RegistryError::from(
                    Error::forbidden(format!("{} may not {action} {repository}", caller.subject))
                        .with_code("DENIED"),
                )
                .into_response()
            }
            Err(err) => return RegistryError::from(err).into_response(),
        }
    }

    request.extensions_mut().insert(caller);
    next.run(request).await
}

fn scope(route: &Route, method: &Method) -> Option<String> {
    if *route == Route::Catalog {
        return Some(format!("{REGISTRY}:catalog:*"));
    }
    let repository = route.repository()?;
    let actions = match route.action(method)? {
        PULL => PULL.to_owned(),
        PUSH => format!("{PULL},{PUSH}"),
        other => other.to_owned(),
    };
    Some(format!("{REPOSITORY}:{repository}:{actions}"))
}

fn challenge(state: &AppState, route: &Route, method: &Method, reason: Challenge) -> Response {
    let token = &state.config.token;
    let mut value = format!("Bearer realm=\"{}\",service=\"{}\"", token.realm, token.service);
    if let Some(scope) = scope(route, method) {
        value.push_str(&format!(",scope=\"{scope}\""));
    }
    let message = match reason {
        Challenge::Missing => "authentication required",
        Challenge::InvalidToken => {
            value.push_str(",error=\"invalid_token\"");
            "invalid credentials"
        }
        Challenge::InsufficientScope => {
            value.push_str(",error=\"insufficient_scope\"");
            "insufficient scope"
        }
    };
    let mut response = RegistryError::from(Error::unauthorized(message)).into_response();
    if let Ok(value) = HeaderValue::try_from(value) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_scopes() {
        let manifest = Route::classify("/v2/library/nginx/manifests/latest");
        assert_eq!(
            scope(&manifest, &Method::GET).as_deref(),
            Some("repository:library/nginx:pull")
        );
        assert_eq!(
            scope(&manifest, &Method::PUT).as_deref(),
            Some("repository:library/nginx:pull,push")
        );
        assert_eq!(
            scope(&manifest, &Method::DELETE).as_deref(),
            Some("repository:library/nginx:delete")
        );
        assert_eq!(
            scope(&Route::Catalog, &Method::GET).as_deref(),
            Some("registry:catalog:*")
        );
        assert_eq!(scope(&Route::Base, &Method::GET), None);
    }
}
