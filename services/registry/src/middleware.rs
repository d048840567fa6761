//! Middleware shared by the registry and management routes.

use std::future::Future;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use harbor_core::Error;
use percent_encoding::percent_decode_str;
use tokio::time::Instant;

use crate::api::AppState;
use crate::error::RegistryError;

/// When the current request must be answered by.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(pub(crate) Instant);

impl Deadline {
    /// A deadline `timeout` from now.
    pub(crate) fn after(timeout: std::time::Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    /// Run `future`, failing with `DEADLINE_EXCEEDED` once the deadline
    /// passes.
    pub(crate) async fn run<F, T, E>(self, future: F) -> harbor_core::Result<T>
    where
        F: Future<Output = Result<T, E>>,
        Error: From<E>,
    {
        match tokio::time::timeout_at(self.0, future).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::deadline_exceeded()),
        }
    }
}

/// Attach a [`Deadline`] to the request and abandon it once passed.
pub(crate) async fn deadline(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let at = Instant::now() + state.config.registry.request_timeout;
    request.extensions_mut().insert(Deadline(at));
    match tokio::time::timeout_at(at, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("Request deadline exceeded");
            RegistryError::from(Error::deadline_exceeded()).into_response()
        }
    }
}

/// Refuse query strings that decode to NUL bytes or invalid UTF-8.
pub(crate) async fn sanitize_query(request: Request, next: Next) -> Response {
    if let Some(query) = request.uri().query() {
        if !is_clean(query) {
            tracing::debug!("Rejected malformed query string");
            return RegistryError::from(
                Error::invalid("query string is not valid UTF-8 or contains NUL")
                    .with_code("BAD_REQUEST"),
            )
            .into_response();
        }
    }
    next.run(request).await
}

fn is_clean(query: &str) -> bool {
    let decoded: Vec<u8> = percent_decode_str(query).collect();
    !decoded.contains(&0) && std::str::from_utf8(&decoded).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_validation() {
        assert!(is_clean("q=tags%3D~release,type%3DIMAGE"));
        assert!(is_clean("q=name%3D%E4%B8%AD%E6%96%87%F0%9F%90%B3"));
        assert!(is_clean("a=b=c&d=~e"));
        assert!(!is_clean("q=abc%00"));
        assert!(!is_clean("q=%FF%FE"));
    }

    #[tokio::test]
    async fn deadline_maps_elapsed_futures() {
        let deadline = Deadline(Instant::now());
        let err = deadline
            .run(std::future::pending::<Result<(), Error>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("DEADLINE_EXCEEDED"));
    }
}
