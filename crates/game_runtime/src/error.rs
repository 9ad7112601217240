//! Error types for the game runtime.
//!
//! Each concern carries its own enum so failures can be handled at the
//! boundary where they occur:
//!
//! * [`TaskError`] - a supervised task panicked or lost its result
//! * [`CodecError`] - a frame or body could not be decoded/encoded
//! * [`ParamError`] - a route rejected its request parameters
//! * [`StoreError`] - the persistence collaborator failed
//! * [`RuntimeError`] - anything surfaced by the server itself

use thiserror::Error;

/// Failure of a single supervised task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task panicked; the payload is rendered as a message.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was dropped before it delivered its result.
    #[error("task dropped before delivering a result")]
    Dropped,
}

impl TaskError {
    /// Builds a [`TaskError::Panicked`] from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panicked(message)
    }
}

/// Wire-level decode and encode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame declares {declared} bytes, above the {max} byte limit")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("frame declares an invalid length of {0} bytes")]
    InvalidLength(usize),

    #[error("frame length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request body is not a JSON object")]
    NotAnObject,

    #[error("missing or non-numeric `cmd` field")]
    MissingCommand,
}

/// Parameter validation failure raised by a route's parse step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("missing parameter `{0}`")]
    Missing(String),

    #[error("invalid parameter `{name}`: {reason}")]
    Invalid { name: String, reason: String },
}

impl ParamError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ParamError::Invalid {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Persistence collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("failed to open transaction: {0}")]
    Begin(String),

    #[error("statement `{statement}` failed: {reason}")]
    Exec { statement: String, reason: String },

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("write-behind store is closed")]
    Closed,
}

/// Errors surfaced by the runtime's connection and server layers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Binding, listening or accepting failed.
    #[error("network error: {0}")]
    Network(String),

    /// A frame or body failed to decode.
    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    /// No route is registered for the command code.
    #[error("route not found for cmd {0}")]
    RouteNotFound(u32),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether the error means the process cannot keep serving traffic.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Network(_))
    }
}
