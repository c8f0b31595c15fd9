use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::input::StreamInput;
use super::session::{Session, SessionId, SessionSnapshot, StateChange};
use super::state::{SessionState, Transition};
use crate::error::{Result, SessionError};

/// One registry entry. The mutex serializes mutations of this session only.
struct SessionSlot {
    session: Mutex<Session>,
    /// Cancelled when a stop is requested; observed by the supervisor.
    stop: CancellationToken,
    /// Mirrors `session.state` for callers waiting on a transition.
    state_tx: watch::Sender<SessionState>,
}

/// Concurrency-safe map from session id to session.
///
/// Independent ids never contend on a shared lock: storage is sharded and each
/// entry carries its own mutex. The only cross-session shared value is the
/// non-terminal counter, updated atomically.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    /// Number of entries in a non-terminal state.
    active: AtomicUsize,
    max_concurrent: usize,
    max_retries: u32,
}

impl SessionRegistry {
    pub fn new(max_concurrent: usize, max_retries: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
            max_concurrent,
            max_retries,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Register a new session in `CREATED`.
    ///
    /// Fails with `InvalidInput` for an empty/malformed URL or an input whose
    /// protocol cannot be classified, and with `CapacityExceeded` when the
    /// non-terminal count is at the maximum. Rejected requests are never
    /// queued.
    pub fn create(&self, input: StreamInput) -> Result<SessionId> {
        let resolved = input.resolve().map_err(|e| match e {
            SessionError::UnsupportedProtocol(scheme) => {
                SessionError::InvalidInput(format!("unsupported protocol: {}", scheme))
            }
            other => other,
        })?;

        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_concurrent).then_some(n + 1)
            })
            .map_err(|_| SessionError::CapacityExceeded {
                max: self.max_concurrent,
            })?;

        let input = StreamInput::new(resolved.url, input.declared_protocol);
        loop {
            let id = SessionId::generate();
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                let session = Session::new(id.clone(), input, resolved.protocol, self.max_retries);
                let (state_tx, _) = watch::channel(session.state);
                slot.insert(Arc::new(SessionSlot {
                    session: Mutex::new(session),
                    stop: CancellationToken::new(),
                    state_tx,
                }));
                info!(session_id = %id, protocol = %resolved.protocol, "Session created");
                return Ok(id);
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.slot(id).ok().map(|slot| slot.session.lock().snapshot())
    }

    /// Snapshots of every entry, oldest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<Arc<SessionSlot>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshots: Vec<SessionSnapshot> = slots
            .iter()
            .map(|slot| slot.session.lock().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Apply a state machine transition to one session.
    pub fn transition(&self, id: &SessionId, transition: Transition) -> Result<StateChange> {
        let slot = self.slot(id)?;
        let mut session = slot.session.lock();
        let change = session.apply(transition)?;

        if change.new_state.is_terminal() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        slot.state_tx.send_replace(change.new_state);

        debug!(
            session_id = %id,
            from = %change.old_state,
            to = %change.new_state,
            retry_count = change.retry_count,
            "Session transition"
        );
        Ok(change)
    }

    /// Drop an entry. Sessions that own a running process cannot be removed.
    pub fn remove(&self, id: &SessionId) -> Result<()> {
        let slot = self.slot(id)?;
        let state = slot.session.lock().state;
        match state {
            SessionState::Starting | SessionState::Playing | SessionState::Stopping => {
                return Err(SessionError::StillActive {
                    id: id.clone(),
                    state,
                });
            }
            SessionState::Created => {
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
            SessionState::Stopped | SessionState::Failed => {}
        }

        self.sessions.remove(id);
        debug!(session_id = %id, "Session removed from registry");
        Ok(())
    }

    /// Signal stop intent. Returns a receiver that tracks the session state
    /// so the caller can wait for `STOPPED`.
    pub fn request_stop(&self, id: &SessionId) -> Result<watch::Receiver<SessionState>> {
        let slot = self.slot(id)?;
        let state = slot.session.lock().state;
        if state.is_terminal() {
            return Err(SessionError::AlreadyTerminal {
                id: id.clone(),
                state,
            });
        }

        slot.stop.cancel();
        Ok(slot.state_tx.subscribe())
    }

    /// Token cancelled once a stop is requested for `id`.
    pub fn stop_token(&self, id: &SessionId) -> Result<CancellationToken> {
        Ok(self.slot(id)?.stop.clone())
    }

    pub fn set_output_ref(&self, id: &SessionId, output_ref: String) -> Result<()> {
        let slot = self.slot(id)?;
        slot.session.lock().output_ref = Some(output_ref);
        Ok(())
    }

    /// Number of sessions in a non-terminal state.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Terminal sessions that ended more than `retention` ago.
    pub fn expired(&self, retention: chrono::Duration) -> Vec<SessionId> {
        let cutoff = chrono::Utc::now() - retention;
        self.list()
            .into_iter()
            .filter(|s| s.state.is_terminal() && s.ended_at.is_some_and(|t| t <= cutoff))
            .map(|s| s.id)
            .collect()
    }

    fn slot(&self, id: &SessionId) -> Result<Arc<SessionSlot>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}
