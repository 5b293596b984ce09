//! Error taxonomy shared by every core operation.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds produced by the core. Transports map these onto their own
/// status codes; `kind()` provides a stable string for that mapping.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum Error {
    /// The request document is malformed: missing messages, bad option
    /// types, unknown keys under strict validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested model id is not known to the manager.
    #[error("model not found: {0}")]
    NotFound(String),

    /// The caller cancelled the request.
    #[error("request canceled")]
    Canceled,

    /// The caller's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The handle is shutting down or the scheduler queue is closed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unload could not complete because streams are still draining.
    #[error("busy: {active_streams} active streams")]
    Busy { active_streams: i32 },

    /// A second unload on an already unloaded handle.
    #[error("already unloaded")]
    AlreadyUnloaded,

    /// Admission queue overflow.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Native call failure, decode error, tokenization error, or a
    /// recovered panic.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable snake_case identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::Canceled => "canceled",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Unavailable(_) => "unavailable",
            Error::Busy { .. } => "busy",
            Error::AlreadyUnloaded => "already_unloaded",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Internal(_) => "internal",
        }
    }

    /// Shorthand for wrapping a displayable failure as `Internal`.
    pub fn internal(err: impl fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}
