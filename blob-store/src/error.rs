use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use harbor_core::{Error, ErrorKind};
use tracing_error::SpanTrace;

/// What went wrong in a storage operation, independent of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The path, blob, manifest, tag or upload does not exist.
    NotFound,

    /// The destination of a write or rename already exists.
    ///
    /// Content-addressed writers treat this as success.
    AlreadyExists,

    /// The bytes written do not hash to the claimed digest.
    DigestMismatch,

    /// A blob is still referenced by a manifest in the repository.
    InUse,

    /// The request itself is malformed (bad media type, bad range, stale
    /// upload offset).
    InvalidRequest,

    /// The driver refused access.
    PermissionDenied,

    /// Disk or network I/O failed; possibly transient.
    Io,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io)
    }

    /// Whether the caller sent something wrong.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::DigestMismatch | StorageErrorKind::InvalidRequest
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::AlreadyExists => write!(f, "already exists"),
            StorageErrorKind::DigestMismatch => write!(f, "digest mismatch"),
            StorageErrorKind::InUse => write!(f, "in use"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
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

/// Storage error with the engine, path and registry error code involved.
///
/// ```rust
/// use blob_store::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "memory",
///     StorageErrorKind::NotFound,
///     "no such blob",
/// )
/// .path("blobs/sha256/ab/abcd/data")
/// .code("BLOB_UNKNOWN")
/// .build();
/// assert_eq!(error.kind(), StorageErrorKind::NotFound);
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    path: Option<String>,
    context: Option<String>,
    code: Option<&'static str>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// A storage error with no path or context.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageError::builder(engine, kind, error).build()
    }

    /// Start building an error with optional path, context and code.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            path: None,
            context: None,
            code: None,
        }
    }

    /// A closure for `map_err` producing an error of `kind`.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// Classify an I/O error.
    pub fn io(engine: &'static str, path: impl Into<String>, error: std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            _ => StorageErrorKind::Io,
        };
        StorageError::builder(engine, kind, error).path(path).build()
    }

    /// Replace the registry error code.
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// Error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Engine that failed.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Path involved, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Additional context, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Registry error code, if one was attached.
    pub fn code(&self) -> Option<&'static str> {
        self.code
    }

    /// Whether the error is likely transient.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Backtrace captured at construction.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Span trace captured at construction.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`StorageError`].
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<String>,
    context: Option<String>,
    code: Option<&'static str>,
}

impl StorageErrorBuilder {
    /// Set the path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the registry error code.
    pub fn code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// Build the error.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            code: self.code,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

impl From<StorageError> for Error {
    fn from(error: StorageError) -> Self {
        let kind = match error.kind {
            StorageErrorKind::NotFound => ErrorKind::NotFound,
            StorageErrorKind::AlreadyExists | StorageErrorKind::InUse => ErrorKind::Conflict,
            StorageErrorKind::DigestMismatch | StorageErrorKind::InvalidRequest => {
                ErrorKind::Invalid
            }
            StorageErrorKind::PermissionDenied => ErrorKind::Forbidden,
            StorageErrorKind::Io => ErrorKind::Retryable,
            StorageErrorKind::Other => ErrorKind::Internal,
        };
        let code = error.code.or(match error.kind {
            StorageErrorKind::DigestMismatch => Some("DIGEST_INVALID"),
            StorageErrorKind::InUse => Some("BLOB_IN_USE"),
            _ => None,
        });
        let message = error.source.to_string();
        let converted = Error::new(kind, message).with_source(error);
        match code {
            Some(code) => converted.with_code(code),
            None => converted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_registry_error() {
        let error = StorageError::builder("memory", StorageErrorKind::DigestMismatch, "bad bytes")
            .path("uploads/x")
            .build();
        assert!(error.kind().is_client_fault());
        let converted: Error = error.into();
        assert_eq!(converted.kind(), ErrorKind::Invalid);
        assert_eq!(converted.code(), Some("DIGEST_INVALID"));
    }

    #[test]
    fn classifies_io_errors() {
        let error = StorageError::io(
            "local",
            "a/b",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(error.kind(), StorageErrorKind::NotFound);
        assert_eq!(error.path(), Some("a/b"));
        assert!(error.to_string().contains("(path: a/b)"));
    }
}
