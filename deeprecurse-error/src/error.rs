//! The engine-wide `Error`

use crate::{ErrorKind, ErrorStatus};
use std::fmt;

/// Error returned by every fallible deeprecurse operation.
///
/// Besides `kind` and `message` it records the `status` a retry loop acts
/// on, the `operation` that failed (earlier operations are kept in the
/// context under `called`), debugging key/value pairs, and the wrapped
/// foreign error if there was one.
///
/// ```rust
/// use deeprecurse_error::{Error, ErrorKind, ErrorStatus};
///
/// let err = Error::new(ErrorKind::BackendFailed, "upstream returned 503")
///     .with_operation("broker::resolve")
///     .with_status(ErrorStatus::Temporary)
///     .with_context("model", "gpt-5-nano")
///     .with_context("depth", "2");
///
/// assert_eq!(err.kind(), ErrorKind::BackendFailed);
/// assert!(err.is_retryable());
/// ```
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Error {
    /// Status defaults from the kind: rate limits, timeouts and network
    /// failures start out temporary, everything else permanent.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: ErrorStatus::default_for(kind),
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    pub fn source_ref(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }

    pub fn with_status(mut self, status: ErrorStatus) -> Self {
        self.status = status;
        self
    }

    pub fn temporary(self) -> Self {
        self.with_status(ErrorStatus::Temporary)
    }

    pub fn permanent(self) -> Self {
        self.with_status(ErrorStatus::Permanent)
    }

    /// Name the failing operation. A previously named one moves into the
    /// context as `called`.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            let previous = self.operation.to_string();
            self.context.push(("called", previous));
        }
        self.operation = operation;
        self
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Attach the underlying error. Setting it twice is a bug and trips a
    /// debug assertion.
    pub fn set_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "source error already set");
        self.source = Some(source.into());
        self
    }

    /// Called by a retry loop that has given up
    pub fn persist(mut self) -> Self {
        self.status = self.status.persist();
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }

    fn write_context(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.context.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, ", context {{ {} }}", pairs.join(", "))
    }
}

/// One line: `Kind (status) at operation, context { k: v } => message`
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;
        if !self.context.is_empty() {
            self.write_context(f)?;
        }
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;
        if !self.message.is_empty() {
            writeln!(f, "  message: {}", self.message)?;
        }
        for (key, value) in &self.context {
            writeln!(f, "  {}: {}", key, value)?;
        }
        if let Some(source) = &self.source {
            writeln!(f, "  source: {:?}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// The only foreign conversion: file stores and config loading hit `io`
/// constantly. Everything else goes through `set_source`.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IoFailed,
        };
        Error::new(kind, err.to_string()).with_operation("io").set_source(err)
    }
}

impl Error {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn manifest_corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ManifestCorrupt, message)
    }

    /// Fetch failure for one segment; the key is also kept as context
    pub fn segment_unavailable(key: impl Into<String>, reason: impl Into<String>) -> Self {
        let key = key.into();
        let message = format!("segment '{}' unavailable: {}", key, reason.into());
        Self::new(ErrorKind::SegmentUnavailable, message).with_context("segment", key)
    }

    /// `transient` picks between a retryable and a final backend failure
    pub fn backend_failed(message: impl Into<String>, transient: bool) -> Self {
        let status = if transient {
            ErrorStatus::Temporary
        } else {
            ErrorStatus::Permanent
        };
        Self::new(ErrorKind::BackendFailed, message).with_status(status)
    }

    pub fn sandbox_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SandboxFault, message)
    }

    pub fn depth_exceeded(depth: usize, max_depth: usize) -> Self {
        Self::new(
            ErrorKind::DepthExceeded,
            format!("depth {} is not below max depth {}", depth, max_depth),
        )
        .with_context("depth", depth.to_string())
        .with_context("max_depth", max_depth.to_string())
    }

    pub fn parse_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseFailed, message)
    }
}
