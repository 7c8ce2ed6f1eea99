//! RPC-shaped error surface shared by both chain planes.
//!
//! The SDK does not carry a transport, so these are the error *kinds* a real
//! transport would map onto wire status codes. Elements match on the variant
//! to decide whether to retry (heal/refresh), compensate, or give up.

use std::fmt;

/// Chain operation outcome. `Status` is deliberately cheap to clone so it can
/// be recorded in per-connection state and replayed to late observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal: {0}")]
    Internal(String),
}

impl Status {
    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        Status::InvalidArgument(msg.to_string())
    }

    pub fn unauthenticated(msg: impl fmt::Display) -> Self {
        Status::Unauthenticated(msg.to_string())
    }

    pub fn permission_denied(msg: impl fmt::Display) -> Self {
        Status::PermissionDenied(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Status::NotFound(msg.to_string())
    }

    pub fn already_exists(msg: impl fmt::Display) -> Self {
        Status::AlreadyExists(msg.to_string())
    }

    pub fn unavailable(msg: impl fmt::Display) -> Self {
        Status::Unavailable(msg.to_string())
    }

    pub fn resource_exhausted(msg: impl fmt::Display) -> Self {
        Status::ResourceExhausted(msg.to_string())
    }

    pub fn failed_precondition(msg: impl fmt::Display) -> Self {
        Status::FailedPrecondition(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Status::Internal(msg.to_string())
    }

    /// Transient errors are the ones heal and refresh keep retrying until the
    /// related token expires; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Status::Unavailable(_) | Status::DeadlineExceeded | Status::ResourceExhausted(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Status::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Status>;
