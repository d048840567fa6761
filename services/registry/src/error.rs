//! Error responses in the Distribution `errors` format.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use blob_store::StorageError;
use harbor_core::{Error, ErrorKind};
use serde_json::Value;

/// Result type of handlers.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// An error rendered as an HTTP response.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct RegistryError(#[from] Error);

impl From<StorageError> for RegistryError {
    fn from(error: StorageError) -> Self {
        RegistryError(error.into())
    }
}

impl RegistryError {
    /// The wrapped error.
    pub fn inner(&self) -> &Error {
        &self.0
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        let code = self.0.code();
        match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Immutable => StatusCode::BAD_REQUEST,
            ErrorKind::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Conflict if code == Some("DIGEST_INVALID") => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::DependencyFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::Retryable if code == Some("DEADLINE_EXCEEDED") => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ErrorKind::Retryable | ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Invalid
                if matches!(code, Some("BLOB_UPLOAD_INVALID") | Some("BLOB_RANGE_INVALID")) =>
            {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Distribution error code for this error.
    pub fn error_code(&self) -> &'static str {
        if self.0.kind() == ErrorKind::Internal {
            return "UNKNOWN";
        }
        self.0.code().unwrap_or(match self.0.kind() {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "DENIED",
            ErrorKind::Immutable => "TAG_IMMUTABLE",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::DependencyFailure => "DEPENDENCY_FAILURE",
            ErrorKind::Retryable => "UNAVAILABLE",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Invalid => "BAD_REQUEST",
            ErrorKind::Internal => "UNKNOWN",
        })
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse<'a> {
    errors: Vec<ErrorDetail<'a>>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a Value>,
}

/// Render a Distribution `errors` body.
pub(crate) fn error_body(code: &'static str, message: &str, detail: Option<&Value>) -> Body {
    let body = ErrorResponse {
        errors: vec![ErrorDetail {
            code,
            message,
            detail,
        }],
    };
    match serde_json::to_vec(&body) {
        Ok(bytes) => Body::from(bytes),
        Err(_) => Body::from(r#"{"errors":[{"code":"UNKNOWN","message":"internal error"}]}"#),
    }
}

/// Marks a response produced from an internal error, so the request id can
/// be filled in as the reference.
#[derive(Debug, Clone, Copy)]
struct InternalError;

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                error = %self.0,
                span_trace = %self.0.span_trace(),
                "Internal error"
            );
            let mut response = (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                error_body(code, "internal error", None),
            )
                .into_response();
            response.extensions_mut().insert(InternalError);
            return response;
        }
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }

        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            error_body(code, self.0.message(), self.0.detail()),
        )
            .into_response();
        if let Some(after) = self.0.retry_after() {
            let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

/// Replace the body of internal error responses with one naming the request
/// id, and never anything from the error itself.
pub(crate) async fn reference_internal_errors(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_owned();
    let response = next.run(request).await;
    if response.extensions().get::<InternalError>().is_none() {
        return response;
    }
    let (mut parts, _) = response.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    let message = format!("internal error, reference id {id}");
    Response::from_parts(parts, error_body("UNKNOWN", &message, None))
}
