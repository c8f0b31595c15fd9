//! Error taxonomy for session management.
//!
//! Input validation and capacity errors are returned synchronously to the
//! caller. Process-level failures never escape as errors: the supervisor
//! absorbs them into retries and only surfaces them as a `FAILED` state with
//! a human-readable `last_error`.

use crate::session::{SessionId, SessionState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Empty or malformed URL, unknown protocol name, conflicting scheme.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Non-terminal session count is at the configured maximum.
    #[error("Capacity exceeded: {max} concurrent sessions already running")]
    CapacityExceeded { max: usize },

    /// URL scheme could not be mapped to a supported transport.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Process crash or startup timeout. Retried by the supervisor.
    #[error("Transient failure: {0}")]
    TransientFailure(String),

    /// Retry ceiling reached; the session is FAILED.
    #[error("Retries exhausted after {retries} attempts")]
    RetryExhausted { retries: u32 },

    /// Operation on a STOPPED or FAILED session.
    #[error("Session {id} is already {state}")]
    AlreadyTerminal { id: SessionId, state: SessionState },

    #[error("Manager is shutting down")]
    ShuttingDown,

    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Invalid transition {transition} from {from}")]
    InvalidTransition {
        from: SessionState,
        transition: &'static str,
    },

    /// Removal requested while the session still owns a process.
    #[error("Session {id} is still {state}")]
    StillActive { id: SessionId, state: SessionState },

    /// Output directory could not be prepared.
    #[error("Output error: {0}")]
    Output(String),
}

impl SessionError {
    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::CapacityExceeded { .. } => "CapacityExceeded",
            Self::UnsupportedProtocol(_) => "UnsupportedProtocol",
            Self::TransientFailure(_) => "TransientFailure",
            Self::RetryExhausted { .. } => "RetryExhausted",
            Self::AlreadyTerminal { .. } => "AlreadyTerminal",
            Self::ShuttingDown => "ShuttingDown",
            Self::NotFound(_) => "NotFound",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::StillActive { .. } => "StillActive",
            Self::Output(_) => "OutputError",
        }
    }

    /// Configuration failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
