//! Error kinds for deeprecurse operations

use std::fmt;

/// The kind of error that occurred.
///
/// This enum categorizes errors to help users write clear error handling logic.
/// Users can match on ErrorKind to decide how to handle specific error cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// Invalid configuration or parameters
    ConfigInvalid,

    /// Invalid argument passed to function
    InvalidArgument,

    // =========================================================================
    // Context errors
    // =========================================================================
    /// Manifest could not be parsed or breaks the contiguity rules
    ManifestCorrupt,

    /// A segment needed by a slice could not be fetched
    SegmentUnavailable,

    // =========================================================================
    // Storage errors
    // =========================================================================
    /// Storage key not found
    StorageNotFound,

    /// Storage operation failed
    StorageFailed,

    /// Serialization/deserialization failed
    SerializationFailed,

    // =========================================================================
    // Backend errors
    // =========================================================================
    /// Language-model backend call failed
    BackendFailed,

    /// Rate limit exceeded
    RateLimited,

    /// An operation did not finish in time
    Timeout,

    // =========================================================================
    // Sandbox errors
    // =========================================================================
    /// User code failed inside the sandbox
    SandboxFault,

    /// Both finalize forms, or one of them twice, in a single block
    FinalizeConflict,

    /// Sandbox host is gone or not answering
    SandboxUnavailable,

    // =========================================================================
    // Recursion errors
    // =========================================================================
    /// A child executor would exceed the maximum depth
    DepthExceeded,

    /// Channel closed unexpectedly
    ChannelClosed,

    // =========================================================================
    // IO errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    /// Network error
    NetworkFailed,

    // =========================================================================
    // Parse errors
    // =========================================================================
    /// Failed to parse input
    ParseFailed,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            // General
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::InvalidArgument => "InvalidArgument",

            // Context
            ErrorKind::ManifestCorrupt => "ManifestCorrupt",
            ErrorKind::SegmentUnavailable => "SegmentUnavailable",

            // Storage
            ErrorKind::StorageNotFound => "StorageNotFound",
            ErrorKind::StorageFailed => "StorageFailed",
            ErrorKind::SerializationFailed => "SerializationFailed",

            // Backend
            ErrorKind::BackendFailed => "BackendFailed",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Timeout => "Timeout",

            // Sandbox
            ErrorKind::SandboxFault => "SandboxFault",
            ErrorKind::FinalizeConflict => "FinalizeConflict",
            ErrorKind::SandboxUnavailable => "SandboxUnavailable",

            // Recursion
            ErrorKind::DepthExceeded => "DepthExceeded",
            ErrorKind::ChannelClosed => "ChannelClosed",

            // IO
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",
            ErrorKind::NetworkFailed => "NetworkFailed",

            // Parse
            ErrorKind::ParseFailed => "ParseFailed",
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkFailed | ErrorKind::RateLimited | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ManifestCorrupt.to_string(), "ManifestCorrupt");
        assert_eq!(ErrorKind::SegmentUnavailable.to_string(), "SegmentUnavailable");
    }

    #[test]
    fn test_is_retryable() {
        assert!(ErrorKind::NetworkFailed.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::ManifestCorrupt.is_retryable());
        assert!(!ErrorKind::DepthExceeded.is_retryable());
        // backend failures carry an explicit status instead
        assert!(!ErrorKind::BackendFailed.is_retryable());
    }
}
