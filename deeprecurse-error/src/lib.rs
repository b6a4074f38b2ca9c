//! # deeprecurse-error
//!
//! One error type for the whole engine.
//!
//! - [`ErrorKind`] says what went wrong (`SegmentUnavailable`, `BackendFailed`, ...)
//! - [`ErrorStatus`] says what a caller may do about it; only `Temporary` is retried
//! - operation and context pairs locate the failure
//! - foreign errors are wrapped as the source, never returned raw
//!
//! ```rust
//! use deeprecurse_error::{Error, ErrorKind};
//!
//! fn fetch() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::SegmentUnavailable, "segment 'corpus/segments/00000003.txt' failed")
//!         .with_operation("context::slice")
//!         .with_context("segment", "corpus/segments/00000003.txt")
//!         .with_context("attempts", "3"))
//! }
//! # assert!(fetch().is_err());
//! ```
//!
//! An error is handled once. Layers above only add context or mark it
//! persistent after their own retries.

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

pub type Result<T> = std::result::Result<T, Error>;
