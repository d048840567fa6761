//! Errors talking to a remote registry.
use std::fmt;
use std::time::Duration;

use harbor_core::{Digest, Error};
use http::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A registry answered with an error status.
#[derive(Debug, Clone)]
pub struct StatusError {
    /// Request method.
    pub method: Method,
    /// Request URL.
    pub url: String,
    /// Response status.
    pub status: StatusCode,
    /// First Distribution error code of the body, if any.
    pub code: Option<String>,
    /// Error message of the body, or the raw body.
    pub message: String,
    /// `Retry-After` of the response.
    pub retry_after: Option<Duration>,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} returned {}", self.method, self.url, self.status)?;
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for StatusError {}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl StatusError {
    pub(crate) fn new(
        method: Method,
        url: impl Into<String>,
        status: StatusCode,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Self {
        let retry_after = headers
            .get(http::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let (code, message) = match serde_json::from_slice::<ErrorBody>(body) {
            Ok(parsed) => match parsed.errors.into_iter().next() {
                Some(entry) => (Some(entry.code), entry.message),
                None => (None, String::new()),
            },
            Err(_) => (None, String::from_utf8_lossy(body).trim().to_owned()),
        };

        StatusError {
            method,
            url: url.into(),
            status,
            code,
            message,
            retry_after,
        }
    }
}

/// Everything that can go wrong in a registry call.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request could not be sent or the response not received.
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// The request timed out.
    #[error("Request timed out")]
    Timeout,

    /// The registry answered with an error status.
    #[error(transparent)]
    Status(StatusError),

    /// A token could not be obtained.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The token expired while a streaming request was in flight. A fresh
    /// token is cached; the request must be repeated.
    #[error("Token expired during a streaming request")]
    Reauthenticated,

    /// Received bytes do not hash to the expected digest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest.
        expected: Digest,
        /// Digest of the received bytes.
        actual: Digest,
        /// Whether the transfer was cut short, as opposed to complete but
        /// different.
        partial: bool,
    },

    /// The registry sent something unexpected.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// The HTTP status, for status errors.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status(err) => Some(err.status),
            _ => None,
        }
    }

    /// Whether the registry reported that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// Whether repeating the call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::Timeout | ClientError::Reauthenticated => true,
            ClientError::Status(err) => {
                err.status.is_server_error()
                    || err.status == StatusCode::TOO_MANY_REQUESTS
                    || err.status == StatusCode::REQUEST_TIMEOUT
            }
            ClientError::DigestMismatch { partial, .. } => *partial,
            ClientError::Auth(_)
            | ClientError::InvalidResponse(_)
            | ClientError::InvalidRequest(_) => false,
        }
    }

    /// Server supplied retry hint.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Status(err) => err.retry_after,
            ClientError::Reauthenticated => Some(Duration::ZERO),
            _ => None,
        }
    }
}

impl From<ClientError> for Error {
    fn from(error: ClientError) -> Self {
        let message = error.to_string();
        if error.is_retryable() {
            let after = error.retry_after();
            return Error::retryable(message, after).with_source(error);
        }

        let converted = match &error {
            ClientError::Status(status) => match status.status {
                StatusCode::UNAUTHORIZED => Error::unauthorized(message),
                StatusCode::FORBIDDEN => Error::forbidden(message),
                StatusCode::NOT_FOUND => Error::not_found(message),
                StatusCode::CONFLICT => Error::conflict(message),
                StatusCode::PAYLOAD_TOO_LARGE => Error::quota_exceeded(message),
                s if s.is_client_error() => Error::invalid(message),
                _ => Error::dependency(message),
            },
            ClientError::Auth(_) => Error::unauthorized(message),
            ClientError::DigestMismatch { .. } => {
                Error::conflict(message).with_code("DIGEST_INVALID")
            }
            ClientError::InvalidRequest(_) => Error::invalid(message),
            _ => Error::dependency(message),
        };
        converted.with_source(error)
    }
}

#[cfg(test)]
mod tests {
    use harbor_core::ErrorKind;

    use super::*;

    fn status(code: u16, body: &str) -> ClientError {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "7".parse().unwrap());
        ClientError::Status(StatusError::new(
            Method::GET,
            "https://r/v2/",
            StatusCode::from_u16(code).unwrap(),
            &headers,
            body.as_bytes(),
        ))
    }

    #[test]
    fn parses_distribution_error_body() {
        let err = status(
            404,
            r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#,
        );
        let ClientError::Status(inner) = &err else {
            panic!("expected status error");
        };
        assert_eq!(inner.code.as_deref(), Some("MANIFEST_UNKNOWN"));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(Error::from(err).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn throttling_is_retryable_with_hint() {
        let err = status(429, "slow down");
        assert!(err.is_retryable());
        let converted = Error::from(err);
        assert_eq!(converted.kind(), ErrorKind::Retryable);
        assert_eq!(converted.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn digest_mismatch_retry_depends_on_completeness() {
        let expected = Digest::sha256(b"a");
        let actual = Digest::sha256(b"b");
        let partial = ClientError::DigestMismatch {
            expected: expected.clone(),
            actual: actual.clone(),
            partial: true,
        };
        assert!(partial.is_retryable());

        let complete = ClientError::DigestMismatch {
            expected,
            actual,
            partial: false,
        };
        assert!(!complete.is_retryable());
        assert_eq!(Error::from(complete).kind(), ErrorKind::Conflict);
    }
}
