//! Error kinds surfaced by the policy engine, telemetry lifecycle, and metadata codec.
//!
//! Security-relevant denials (`PermissionDenied`, `AccessDenied`) are returned to
//! the caller *and* recorded as events by the policy engine. Codec failures are
//! returned only. `ResourceExhausted` exists for completeness of the taxonomy but
//! the telemetry path never returns it: a full ring is reported via drop counters.

use thiserror::Error;

/// Copyable discriminant of a [`GateError`], for matching without the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    PermissionDenied,
    AccessDenied,
    NotFound,
    MalformedInput,
    AlreadyInitialized,
    NotInitialized,
    ResourceExhausted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("already initialized: {0}")]
    AlreadyInitialized(String),
    #[error("not initialized: {0}")]
    NotInitialized(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            GateError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            GateError::AccessDenied(_) => ErrorKind::AccessDenied,
            GateError::NotFound(_) => ErrorKind::NotFound,
            GateError::MalformedInput(_) => ErrorKind::MalformedInput,
            GateError::AlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
            GateError::NotInitialized(_) => ErrorKind::NotInitialized,
            GateError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Denials the capture path treats as fatal for one attempt only.
    pub fn is_denial(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PermissionDenied | ErrorKind::AccessDenied
        )
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        GateError::MalformedInput(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        GateError::InvalidArgument(msg.into())
    }
}

pub type GateResult<T> = std::result::Result<T, GateError>;
