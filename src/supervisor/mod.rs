//! Session supervision
//!
//! `SessionManager` is the facade used by the Control API. Each session gets
//! its own control loop so a slow transcoder never delays another session.

mod backoff;
mod manager;
mod runner;

pub use backoff::BackoffPolicy;
pub use manager::{SessionManager, StopAck, SupervisorConfig};
