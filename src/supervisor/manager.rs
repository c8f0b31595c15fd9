use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::backoff::BackoffPolicy;
use super::runner::SessionRunner;
use crate::error::{Result, SessionError};
use crate::events::{EventBus, Subscription};
use crate::metrics::{LatestMetrics, MetricsSampler, MetricsSnapshot};
use crate::output::OutputPublisher;
use crate::session::{
    ResolvedInput, SessionId, SessionRegistry, SessionSnapshot, SessionState, StreamInput,
};
use crate::transcoder::TranscoderAdapter;

/// Added to the stop grace period when a caller waits for `STOPPED`.
const STOP_WAIT_MARGIN: Duration = Duration::from_secs(1);

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_concurrent_sessions: usize,
    pub backoff: BackoffPolicy,
    /// Time allowed for an attempt to produce its first output
    pub startup_deadline: Duration,
    /// Time allowed for a graceful transcoder exit before it is killed
    pub stop_grace: Duration,
    /// Nominal duration recorded for each published segment
    pub segment_duration: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            backoff: BackoffPolicy::default(),
            startup_deadline: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            segment_duration: Duration::from_secs(2),
        }
    }
}

/// Reply to a stop request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopAck {
    pub session_id: SessionId,
    pub state: SessionState,
    /// False when the wait timed out; `STOPPED` follows asynchronously.
    pub completed: bool,
}

struct Inner {
    registry: Arc<SessionRegistry>,
    publisher: Arc<OutputPublisher>,
    adapter: Arc<dyn TranscoderAdapter>,
    bus: EventBus,
    config: SupervisorConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    latest_metrics: LatestMetrics,
}

/// Entry point for everything session related.
///
/// Owns the registry, the publisher and one supervisor task per session.
/// Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: SupervisorConfig,
        publisher: OutputPublisher,
        adapter: Arc<dyn TranscoderAdapter>,
        bus: EventBus,
    ) -> Self {
        let registry = SessionRegistry::new(
            config.max_concurrent_sessions,
            config.backoff.max_retries,
        );

        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(registry),
                publisher: Arc::new(publisher),
                adapter,
                bus,
                config,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                latest_metrics: Arc::new(RwLock::new(None)),
            }),
        }
    }

    /// Create a session and hand it to its own supervisor task.
    ///
    /// Returns once the session is registered; the supervisor moves it to
    /// `STARTING` right after.
    pub async fn start(&self, input: StreamInput) -> Result<SessionSnapshot> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }

        let id = inner.registry.create(input)?;

        // Lost the race against shutdown.
        if inner.shutdown.is_cancelled() {
            self.rollback(&id).await;
            return Err(SessionError::ShuttingDown);
        }

        let output_ref = match inner.publisher.open(&id).await {
            Ok(output_ref) => output_ref,
            Err(e) => {
                warn!(session_id = %id, "Failed to open output: {:#}", e);
                self.rollback(&id).await;
                return Err(SessionError::Output(format!("{:#}", e)));
            }
        };
        inner.registry.set_output_ref(&id, output_ref)?;

        let snapshot = inner
            .registry
            .get(&id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let runner = SessionRunner {
            id: id.clone(),
            input: ResolvedInput {
                url: snapshot.url.clone(),
                protocol: snapshot.protocol,
            },
            stop: inner.registry.stop_token(&id)?,
            registry: Arc::clone(&inner.registry),
            publisher: Arc::clone(&inner.publisher),
            adapter: Arc::clone(&inner.adapter),
            bus: inner.bus.clone(),
            config: inner.config.clone(),
        };
        inner.tasks.spawn(runner.run());

        info!(session_id = %id, url = %snapshot.url, "Session started");
        Ok(snapshot)
    }

    /// Request a stop and wait up to the grace period (plus a margin) for
    /// `STOPPED`.
    pub async fn stop(&self, id: &SessionId) -> Result<StopAck> {
        let inner = &self.inner;
        let mut state_rx = inner.registry.request_stop(id)?;
        info!(session_id = %id, "Stop requested");

        let limit = inner.config.stop_grace + STOP_WAIT_MARGIN;
        let (state, completed) =
            match tokio::time::timeout(limit, state_rx.wait_for(|s| s.is_terminal())).await {
                Ok(Ok(state)) => (*state, true),
                // Entry already dropped after reaching STOPPED.
                Ok(Err(_)) => (SessionState::Stopped, true),
                Err(_) => {
                    let state = inner
                        .registry
                        .get(id)
                        .map_or(SessionState::Stopping, |s| s.state);
                    warn!(session_id = %id, state = %state, "Stop still in progress after {:?}", limit);
                    (state, false)
                }
            };

        Ok(StopAck {
            session_id: id.clone(),
            state,
            completed,
        })
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionSnapshot> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.inner.registry.list()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn publisher(&self) -> &OutputPublisher {
        &self.inner.publisher
    }

    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.latest_metrics.read().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Run the metrics sampler until shutdown.
    pub fn spawn_metrics(&self, sampler: MetricsSampler, interval: Duration) {
        let inner = &self.inner;
        inner.tasks.spawn(Arc::new(sampler).run(
            interval,
            inner.bus.clone(),
            Arc::clone(&inner.latest_metrics),
            inner.shutdown.clone(),
        ));
    }

    /// Periodically drop terminal sessions older than `retention`.
    pub fn spawn_gc(&self, interval: Duration, retention: Duration) {
        let manager = self.clone();
        self.inner.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.collect_garbage(retention).await;
                    }
                }
            }
        });
    }

    /// Remove expired terminal sessions and their output. Returns how many
    /// were removed.
    pub async fn collect_garbage(&self, retention: Duration) -> usize {
        let inner = &self.inner;
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(52));

        let mut removed = 0;
        for id in inner.registry.expired(retention) {
            if let Err(e) = inner.registry.remove(&id) {
                warn!(session_id = %id, "Failed to collect session: {}", e);
                continue;
            }
            if let Err(e) = inner.publisher.close(&id).await {
                warn!(session_id = %id, "Failed to remove output: {:#}", e);
            }
            removed += 1;
        }

        if removed > 0 {
            info!("Collected {} expired sessions", removed);
        }
        removed
    }

    /// Reject new sessions, stop every running one and wait for the
    /// supervisors to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down session manager");
        inner.shutdown.cancel();

        for id in inner.registry.ids() {
            // Terminal sessions refuse; nothing to do for them.
            let _ = inner.registry.request_stop(&id);
        }

        inner.tasks.close();
        let limit = inner.config.stop_grace + STOP_WAIT_MARGIN;
        if tokio::time::timeout(limit, inner.tasks.wait()).await.is_err() {
            warn!("Supervisors still running after {:?}", limit);
        }
        info!("Session manager stopped");
    }

    async fn rollback(&self, id: &SessionId) {
        if let Err(e) = self.inner.registry.remove(id) {
            warn!(session_id = %id, "Failed to roll back session: {}", e);
        }
        if let Err(e) = self.inner.publisher.close(id).await {
            warn!(session_id = %id, "Failed to remove output: {:#}", e);
        }
    }
}
