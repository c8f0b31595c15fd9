use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session.
///
/// ```text
/// CREATED -> STARTING -> PLAYING -> STOPPING -> STOPPED
///               ^  |        |          ^
///               +--+--------+ (retry)  |
///               |  |                   |
///               |  +--> FAILED         |
///               +----------------------+ (stop)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Starting,
    Playing,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Starting => "STARTING",
            Self::Playing => "PLAYING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    /// STOPPED and FAILED are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine. Only the supervisor issues them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// CREATED -> STARTING
    Begin,
    /// STARTING -> PLAYING, on first observable output.
    Output,
    /// STARTING/PLAYING -> STARTING, consuming one retry.
    Retry { reason: String },
    /// STARTING/PLAYING -> FAILED
    Fail { reason: String },
    /// STARTING/PLAYING -> STOPPING
    RequestStop,
    /// STOPPING -> STOPPED
    Stopped,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Output => "output",
            Self::Retry { .. } => "retry",
            Self::Fail { .. } => "fail",
            Self::RequestStop => "request_stop",
            Self::Stopped => "stopped",
        }
    }

    /// Target state when applied to `from`, or `None` if not allowed.
    ///
    /// Terminal states accept nothing; callers report those separately as
    /// `AlreadyTerminal`.
    pub fn target(&self, from: SessionState) -> Option<SessionState> {
        use SessionState::*;
        match (self, from) {
            (_, Stopped | Failed) => None,
            (Self::Begin, Created) => Some(Starting),
            (Self::Output, Starting) => Some(Playing),
            (Self::Retry { .. }, Starting | Playing) => Some(Starting),
            (Self::Fail { .. }, Starting | Playing) => Some(Failed),
            (Self::RequestStop, Starting | Playing) => Some(Stopping),
            (Self::Stopped, Stopping) => Some(Stopped),
            _ => None,
        }
    }
}
