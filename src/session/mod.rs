//! Session data model and registry
//!
//! This module provides:
//! - `StreamInput` / `Protocol`: the immutable input descriptor and scheme resolution
//! - `SessionState` / `Transition`: the lifecycle state machine
//! - `Session` / `SessionSnapshot`: the unit of work and its read-only copy
//! - `SessionRegistry`: the concurrency-safe id → session map with capacity limits

mod input;
mod registry;
mod session;
mod state;

pub use input::{Protocol, ResolvedInput, StreamInput};
pub use registry::SessionRegistry;
pub use session::{Session, SessionId, SessionSnapshot, StateChange};
pub use state::{SessionState, Transition};
