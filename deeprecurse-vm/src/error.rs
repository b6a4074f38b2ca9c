//! VM error helpers
//!
//! Re-exports deeprecurse-error and provides VM-specific constructors.

pub use deeprecurse_error::{Error, ErrorKind, ErrorStatus, Result};

// =============================================================================
// VM-specific error constructors
// =============================================================================

/// Create a ManifestCorrupt error
pub fn manifest_corrupt(message: impl Into<String>) -> Error {
    Error::manifest_corrupt(message)
}

/// Create a SegmentUnavailable error
pub fn segment_unavailable(key: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::segment_unavailable(key, reason)
}

/// Create a BackendFailed error
pub fn backend_failed(message: impl Into<String>, transient: bool) -> Error {
    Error::backend_failed(message, transient)
}

/// Create a RateLimited error
pub fn rate_limited(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::RateLimited, message)
}

/// Create a NetworkFailed error
pub fn network_failed(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::NetworkFailed, message)
}

/// Create a Timeout error
pub fn timeout(operation: impl Into<String>, secs: f64) -> Error {
    let operation = operation.into();
    Error::new(
        ErrorKind::Timeout,
        format!("'{}' timed out after {:.1}s", operation, secs),
    )
    .with_context("target", operation)
}

/// Create a SandboxFault error
pub fn sandbox_fault(message: impl Into<String>) -> Error {
    Error::sandbox_fault(message)
}

/// Create a FinalizeConflict error
pub fn finalize_conflict(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::FinalizeConflict, message)
}

/// Create a SandboxUnavailable error
pub fn sandbox_unavailable(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::SandboxUnavailable, reason)
}

/// Create a DepthExceeded error
pub fn depth_exceeded(depth: usize, max_depth: usize) -> Error {
    Error::depth_exceeded(depth, max_depth)
}

/// Create a ChannelClosed error
pub fn channel_closed(name: impl Into<String>) -> Error {
    let name = name.into();
    Error::new(ErrorKind::ChannelClosed, format!("channel '{}' closed", name))
        .with_context("channel", name)
}

/// Create a ParseError error
pub fn parse_error(message: impl Into<String>) -> Error {
    Error::parse_failed(message)
}

/// Create an InvalidArgument error
pub fn invalid_argument(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidArgument, message)
}

/// Create an IoError error
pub fn io_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::IoFailed, message)
}

/// Create a SerializationError error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::SerializationFailed, message)
}

/// Create a StorageNotFound error
pub fn storage_not_found(key: impl Into<String>) -> Error {
    let key = key.into();
    Error::new(ErrorKind::StorageNotFound, format!("storage key '{}' not found", key))
        .with_context("key", key)
}

/// Create a StorageFailed error
pub fn storage_failed(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::StorageFailed, reason)
}
