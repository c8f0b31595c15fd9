//! Per-session control loop.
//!
//! One task per session drives the state machine: start an attempt, watch
//! it, retry with backoff on failure, and tear down on stop. All transitions
//! and their bus events for a session come from this task, which gives
//! per-session ordering for free.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manager::SupervisorConfig;
use crate::error::SessionError;
use crate::events::{Event, EventBus};
use crate::output::{OutputPublisher, Segment};
use crate::session::{ResolvedInput, SessionId, SessionRegistry, StateChange, Transition};
use crate::transcoder::{
    ExitClass, HandleEvent, StartRequest, TranscoderAdapter, TranscoderEvent, TranscoderHandle,
};

/// How the attempt loop ended.
enum Outcome {
    /// Stop was requested. Carries the live attempt, if any.
    StopRequested(Option<TranscoderHandle>),
    Failed(String),
    /// Bookkeeping broke; nothing more can be done for this session.
    Aborted,
}

/// Result of a failed attempt.
enum Recovery {
    Retry,
    Stop,
    GiveUp(String),
    Abort,
}

pub(crate) struct SessionRunner {
    pub id: SessionId,
    pub input: ResolvedInput,
    pub stop: CancellationToken,
    pub registry: Arc<SessionRegistry>,
    pub publisher: Arc<OutputPublisher>,
    pub adapter: Arc<dyn TranscoderAdapter>,
    pub bus: EventBus,
    pub config: SupervisorConfig,
}

impl SessionRunner {
    pub async fn run(self) {
        info!(session_id = %self.id, adapter = self.adapter.name(), "Supervisor started");

        match self.drive().await {
            Outcome::StopRequested(handle) => self.finish_stopped(handle).await,
            Outcome::Failed(reason) => self.finish_failed(reason).await,
            Outcome::Aborted => {
                error!(session_id = %self.id, "Supervisor aborted");
            }
        }
    }

    async fn drive(&self) -> Outcome {
        // Even a session stopped before its first attempt passes through
        // STARTING; STOPPING is never entered from CREATED.
        if self.apply(Transition::Begin).is_err() {
            return Outcome::Aborted;
        }

        let mut attempt: u32 = 0;
        loop {
            if self.stop.is_cancelled() {
                return Outcome::StopRequested(None);
            }

            let request = StartRequest {
                session_id: self.id.clone(),
                input: self.input.clone(),
                spool_dir: self.publisher.spool_dir(&self.id),
                startup_deadline: self.config.startup_deadline,
            };

            let reason = match self.adapter.start(&request).await {
                Ok(handle) => match self.watch(handle, attempt > 0).await {
                    Ok(class) => class.to_string(),
                    Err(outcome) => return outcome,
                },
                Err(e) if !e.is_retryable() => {
                    warn!(session_id = %self.id, "Transcoder rejected input: {}", e);
                    return Outcome::Failed(e.to_string());
                }
                Err(e) => {
                    warn!(session_id = %self.id, "Transcoder failed to start: {}", e);
                    "transcoder failed to start".to_string()
                }
            };
            attempt += 1;

            if self.stop.is_cancelled() {
                return Outcome::StopRequested(None);
            }

            match self.recover(reason).await {
                Recovery::Retry => continue,
                Recovery::Stop => return Outcome::StopRequested(None),
                Recovery::GiveUp(reason) => return Outcome::Failed(reason),
                Recovery::Abort => return Outcome::Aborted,
            }
        }
    }

    /// Follow one attempt until it exits or a stop is requested.
    async fn watch(
        &self,
        mut handle: TranscoderHandle,
        restarted: bool,
    ) -> Result<ExitClass, Outcome> {
        let mut playing = false;
        let mut discontinuity = restarted;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(Outcome::StopRequested(Some(handle))),
                event = handle.next() => event,
            };

            let output = match event {
                HandleEvent::Output(output) => output,
                HandleEvent::Exited(class) => {
                    info!(session_id = %self.id, outcome = %class, "Transcoder exited");
                    return Ok(class);
                }
            };

            if !playing {
                playing = true;
                if self.apply(Transition::Output).is_err() {
                    return Err(Outcome::Aborted);
                }
            }

            if let TranscoderEvent::SegmentCompleted(path) = output {
                let segment = Segment {
                    path,
                    duration: self.config.segment_duration,
                    discontinuity,
                };
                match self.publisher.ingest(&self.id, segment).await {
                    Ok(_) => discontinuity = false,
                    Err(e) => warn!(session_id = %self.id, "Failed to publish segment: {:#}", e),
                }
            }
        }
    }

    /// Consume a retry and back off, or give up at the ceiling.
    async fn recover(&self, reason: String) -> Recovery {
        let policy = self.config.backoff;
        let retry_count = self.registry.get(&self.id).map_or(0, |s| s.retry_count);
        if !policy.should_retry(retry_count) {
            return self.give_up(exhausted(&reason, retry_count));
        }

        let change = match self.registry.transition(&self.id, Transition::Retry { reason: reason.clone() }) {
            Ok(change) => change,
            Err(SessionError::RetryExhausted { retries }) => {
                return self.give_up(exhausted(&reason, retries));
            }
            Err(e) => {
                error!(session_id = %self.id, "Failed to record retry: {}", e);
                return Recovery::Abort;
            }
        };
        self.publish(&change);

        let delay = policy.delay_for(change.retry_count);
        info!(
            session_id = %self.id,
            retry = change.retry_count,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Restarting transcoder after: {}", reason
        );

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Recovery::Stop,
            _ = tokio::time::sleep(delay) => Recovery::Retry,
        }
    }

    /// A stop accepted while the last attempt was ending wins over failure.
    fn give_up(&self, reason: String) -> Recovery {
        if self.stop.is_cancelled() {
            return Recovery::Stop;
        }
        Recovery::GiveUp(reason)
    }

    async fn finish_stopped(&self, handle: Option<TranscoderHandle>) {
        if self.apply(Transition::RequestStop).is_err() {
            return;
        }

        if let Some(mut handle) = handle {
            let class = handle.stop(self.config.stop_grace).await;
            debug!(session_id = %self.id, outcome = %class, "Transcoder stopped");
        }

        if self.apply(Transition::Stopped).is_err() {
            return;
        }

        self.close_output().await;
        if let Err(e) = self.registry.remove(&self.id) {
            warn!(session_id = %self.id, "Failed to remove stopped session: {}", e);
        }
        info!(session_id = %self.id, "Session stopped");
    }

    async fn finish_failed(&self, reason: String) {
        if self.stop.is_cancelled() {
            return self.finish_stopped(None).await;
        }
        if self.apply(Transition::Fail { reason: reason.clone() }).is_err() {
            return;
        }
        self.close_output().await;
        warn!(session_id = %self.id, "Session failed: {}", reason);
    }

    async fn close_output(&self) {
        if let Err(e) = self.publisher.close(&self.id).await {
            warn!(session_id = %self.id, "Failed to remove output: {:#}", e);
        }
    }

    fn apply(&self, transition: Transition) -> Result<StateChange, SessionError> {
        let name = transition.name();
        let change = self.registry.transition(&self.id, transition).map_err(|e| {
            error!(session_id = %self.id, transition = name, "Transition rejected: {}", e);
            e
        })?;
        self.publish(&change);
        Ok(change)
    }

    fn publish(&self, change: &StateChange) {
        self.bus.publish(Event::from(change));
    }
}

fn exhausted(reason: &str, retries: u32) -> String {
    format!("{} (gave up after {} retries)", reason, retries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PublisherConfig;
    use crate::session::{Protocol, StreamInput};
    use crate::supervisor::BackoffPolicy;
    use async_trait::async_trait;

    struct Unused;

    #[async_trait]
    impl TranscoderAdapter for Unused {
        fn name(&self) -> &str {
            "unused"
        }

        async fn start(&self, _request: &StartRequest) -> Result<TranscoderHandle, SessionError> {
            Err(SessionError::TransientFailure("not started".to_string()))
        }
    }

    /// A runner whose session is STARTING with no retries left.
    async fn exhausted_runner(root: &std::path::Path) -> SessionRunner {
        let registry = Arc::new(SessionRegistry::new(4, 0));
        let id = registry.create(StreamInput::auto("srt://host:1234")).unwrap();
        registry.transition(&id, Transition::Begin).unwrap();

        let publisher = Arc::new(OutputPublisher::new(PublisherConfig {
            root: root.to_path_buf(),
            ..PublisherConfig::default()
        }));
        publisher.open(&id).await.unwrap();

        SessionRunner {
            id: id.clone(),
            input: ResolvedInput {
                url: "srt://host:1234".to_string(),
                protocol: Protocol::Srt,
            },
            stop: registry.stop_token(&id).unwrap(),
            registry,
            publisher,
            adapter: Arc::new(Unused),
            bus: EventBus::new(),
            config: SupervisorConfig {
                backoff: BackoffPolicy {
                    max_retries: 0,
                    ..BackoffPolicy::default()
                },
                ..SupervisorConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_give_up() {
        let dir = tempfile::tempdir().unwrap();
        let runner = exhausted_runner(dir.path()).await;

        assert!(matches!(
            runner.recover("crashed".to_string()).await,
            Recovery::GiveUp(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_accepted_at_retry_ceiling_wins_over_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = exhausted_runner(dir.path()).await;
        runner.registry.request_stop(&runner.id).unwrap();

        assert!(matches!(
            runner.recover("crashed".to_string()).await,
            Recovery::Stop
        ));

        let mut events = runner.bus.subscribe();
        runner.finish_failed("crashed (gave up after 0 retries)".to_string()).await;

        // Ends STOPPED, never FAILED, and the entry is dropped.
        let mut states = Vec::new();
        while let Ok(Some(Event::StateChanged { new_state, .. })) =
            tokio::time::timeout(std::time::Duration::from_millis(50), events.recv()).await
        {
            states.push(new_state);
        }
        assert_eq!(
            states,
            vec![
                crate::session::SessionState::Stopping,
                crate::session::SessionState::Stopped
            ]
        );
        assert!(runner.registry.get(&runner.id).is_none());
        assert!(!dir.path().join(runner.id.as_str()).exists());
    }
}
