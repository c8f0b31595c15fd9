use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::input::{Protocol, StreamInput};
use super::state::{SessionState, Transition};
use crate::error::SessionError;

/// Opaque session identifier. Doubles as the output namespace key, so it is
/// restricted to ASCII alphanumerics and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse an externally supplied id. Rejects anything that could escape
    /// the output directory.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        valid.then(|| Self(raw.to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit of work: one supervised stream.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub input: StreamInput,
    /// Concrete protocol after resolving `Auto`.
    pub protocol: Protocol,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub output_ref: Option<String>,
}

/// Immutable copy of a session handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub url: String,
    pub protocol: Protocol,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub output_ref: Option<String>,
}

/// Record of one applied transition, published on the event bus.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub session_id: SessionId,
    pub old_state: SessionState,
    pub new_state: SessionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, input: StreamInput, protocol: Protocol, max_retries: u32) -> Self {
        Self {
            id,
            input,
            protocol,
            state: SessionState::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            retry_count: 0,
            max_retries,
            last_error: None,
            output_ref: None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state,
            url: self.input.url.clone(),
            protocol: self.protocol,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            output_ref: self.output_ref.clone(),
        }
    }

    /// Apply a transition, updating timestamps, retry bookkeeping and
    /// `last_error`.
    ///
    /// `retry_count` never exceeds `max_retries`: a `Retry` at the ceiling is
    /// refused with `RetryExhausted` and the caller must `Fail` instead.
    pub fn apply(&mut self, transition: Transition) -> Result<StateChange, SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::AlreadyTerminal {
                id: self.id.clone(),
                state: self.state,
            });
        }

        let target = transition
            .target(self.state)
            .ok_or(SessionError::InvalidTransition {
                from: self.state,
                transition: transition.name(),
            })?;

        let now = Utc::now();
        match transition {
            Transition::Begin => {
                self.started_at = Some(now);
            }
            Transition::Output => {
                self.last_error = None;
            }
            Transition::Retry { reason } => {
                if self.retry_count >= self.max_retries {
                    return Err(SessionError::RetryExhausted {
                        retries: self.retry_count,
                    });
                }
                self.retry_count += 1;
                self.last_error = Some(reason);
            }
            Transition::Fail { reason } => {
                self.last_error = Some(reason);
                // Output is torn down on failure.
                self.output_ref = None;
            }
            Transition::RequestStop | Transition::Stopped => {}
        }

        let old_state = self.state;
        self.state = target;
        if target.is_terminal() {
            self.ended_at = Some(now);
        }

        Ok(StateChange {
            session_id: self.id.clone(),
            old_state,
            new_state: target,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            at: now,
        })
    }
}
