//! Remote platform error types.
//!
//! Adapters classify every failure as transient or permanent. The distinction
//! drives retry decisions in the trigger-and-wait unit and in the adapters'
//! own read paths:
//!
//! - **Transient** errors are retriable (server errors, rate limits, network trouble)
//! - **Permanent** errors are returned immediately (bad requests, auth, missing jobs)

use thiserror::Error;

/// The kind of platform error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// Safe to retry with backoff.
    Transient,
    /// Requires intervention; retrying will not help.
    Permanent,
}

impl PlatformErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, PlatformErrorKind::Transient)
    }
}

/// An error returned by a `RemotePlatform` implementation.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} platform error: {message}")]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub message: String,
}

impl PlatformError {
    pub fn transient(message: impl Into<String>) -> Self {
        PlatformError {
            kind: PlatformErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        PlatformError {
            kind: PlatformErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_retriable()
    }
}
