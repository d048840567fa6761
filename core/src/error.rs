use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

/// Result alias used across the registry access plane.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categorizes failures by what the caller should do about them, independent
/// of which component produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing repository, artifact, tag, blob, or entity.
    NotFound,

    /// Authentication failed or was not attempted.
    Unauthorized,

    /// Authenticated, but a policy denies the operation.
    Forbidden,

    /// Write rejected by a tag immutability rule.
    Immutable,

    /// The write would push the project over its storage quota.
    QuotaExceeded,

    /// Digest mismatch, duplicate resource, or concurrent modification.
    Conflict,

    /// A backend, adapter, or scanner failed.
    DependencyFailure,

    /// Transient failure. The error may carry a suggested backoff.
    Retryable,

    /// Cooperative cancellation was observed.
    Cancelled,

    /// Malformed input: bad digest, bad manifest bytes, invalid query.
    Invalid,

    /// Unexpected invariant violation.
    Internal,
}

impl ErrorKind {
    /// Returns whether an operation failing with this kind may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }

    /// Stable, human readable name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::Immutable => "Immutable",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::DependencyFailure => "DependencyFailure",
            ErrorKind::Retryable => "Retryable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Invalid => "Invalid",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ErrorTrace {
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Error shared by every component of the access plane.
///
/// Carries a semantic [`ErrorKind`], a message that is safe to show to
/// clients (except for [`ErrorKind::Internal`]), an optional Distribution
/// error code and JSON detail, an optional retry hint and the cause chain.
///
/// ```rust
/// use harbor_core::{Error, ErrorKind};
///
/// let err = Error::immutable("tag matched immutable rule 'release-*'")
///     .with_code("TAG_IMMUTABLE");
/// assert_eq!(err.kind(), ErrorKind::Immutable);
/// assert_eq!(err.code(), Some("TAG_IMMUTABLE"));
/// ```
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
    code: Option<&'static str>,
    detail: Option<serde_json::Value>,
    retry_after: Option<Duration>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    traces: Box<ErrorTrace>,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("code", &self.code)
            .field("detail", &self.detail)
            .field("retry_after", &self.retry_after)
            .field("source", &self.source)
            .finish()
    }
}

impl Error {
    /// Create an error of the given kind.
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            kind,
            message: message.into(),
            code: None,
            detail: None,
            retry_after: None,
            source: None,
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Returns a closure which wraps a downstream error, for use with `.map_err()`.
    ///
    /// ```rust
    /// use harbor_core::{Error, ErrorKind};
    ///
    /// fn parse(s: &str) -> harbor_core::Result<u64> {
    ///     s.parse::<u64>().map_err(Error::with(ErrorKind::Invalid, "size is not a number"))
    /// }
    /// assert!(parse("x").is_err());
    /// ```
    pub fn with<E>(
        kind: ErrorKind,
        message: impl Into<Cow<'static, str>>,
    ) -> impl FnOnce(E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let message = message.into();
        move |error: E| Error::new(kind, message).with_source(error)
    }

    /// Missing entity.
    #[track_caller]
    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Missing or bad credentials.
    #[track_caller]
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Policy denied.
    #[track_caller]
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Immutability rule matched.
    #[track_caller]
    pub fn immutable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Immutable, message)
    }

    /// Quota would be exceeded.
    #[track_caller]
    pub fn quota_exceeded(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    /// Conflicting state.
    #[track_caller]
    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Downstream dependency failed.
    #[track_caller]
    pub fn dependency(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::DependencyFailure, message)
    }

    /// Transient failure with an optional suggested delay before retrying.
    #[track_caller]
    pub fn retryable(message: impl Into<Cow<'static, str>>, after: Option<Duration>) -> Self {
        let mut err = Self::new(ErrorKind::Retryable, message);
        err.retry_after = after;
        err
    }

    /// Cancellation observed.
    #[track_caller]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    /// The request deadline passed before the operation completed.
    #[track_caller]
    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::Retryable, "deadline exceeded").with_code("DEADLINE_EXCEEDED")
    }

    /// Malformed input.
    #[track_caller]
    pub fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    /// Invariant violation.
    #[track_caller]
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Set the Distribution error code reported to clients.
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach structured detail reported to clients.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.source = Some(source.into());
        self
    }

    /// Suggest a delay before retrying.
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// Replace the message, keeping kind and cause.
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = message.into();
        self
    }

    /// The semantic kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Distribution error code, if one was set.
    pub fn code(&self) -> Option<&'static str> {
        self.code
    }

    /// Structured detail, if any.
    pub fn detail(&self) -> Option<&serde_json::Value> {
        self.detail.as_ref()
    }

    /// Suggested delay before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Whether the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Whether this error represents observed cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Captured tracing span context.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::invalid("malformed JSON document").with_source(error)
    }
}
