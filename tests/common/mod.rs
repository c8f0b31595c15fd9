// Shared helpers for integration tests: a scripted transcoder adapter that
// never spawns a real process, and a manager wired with small timings.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use vplayer::output::{OutputPublisher, PublisherConfig};
use vplayer::transcoder::{ProcessControl, ProcessExit, TranscoderEvent};
use vplayer::{
    BackoffPolicy, EventBus, SessionError, SessionId, SessionManager, SessionSnapshot,
    StartRequest, SupervisorConfig, TranscoderAdapter, TranscoderHandle,
};

/// What one fake attempt does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Exit with a non-zero status right away.
    Crash,
    /// Never produce output; exit only when killed.
    Hang,
    /// Connect, write `segments` segments, then run until stopped.
    Play { segments: usize },
    /// Connect, write `segments` segments, then crash.
    PlayThenCrash { segments: usize },
    /// Connect, then crash as soon as a graceful stop is requested.
    CrashOnStop,
    /// Refuse to start with a configuration error.
    Reject,
}

pub struct FakeAdapter {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    starts: AtomicUsize,
}

impl FakeAdapter {
    pub fn always(script: Script) -> Arc<Self> {
        Self::sequence(Vec::new(), script)
    }

    /// Run `scripts` in order, then `fallback` forever.
    pub fn sequence(scripts: Vec<Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            starts: AtomicUsize::new(0),
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Script {
        self.scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl TranscoderAdapter for FakeAdapter {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, request: &StartRequest) -> Result<TranscoderHandle, SessionError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let script = self.next_script();
        if let Script::Reject = script {
            return Err(SessionError::UnsupportedProtocol("rejected by fake".to_string()));
        }

        let (event_tx, event_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        let control = ProcessControl::new();
        let process = control.clone();
        let spool = request.spool_dir.clone();

        tokio::spawn(async move {
            let exit = match script {
                Script::Crash | Script::Reject => ProcessExit::Code(1),
                Script::Hang => {
                    process.kill_requested().await;
                    ProcessExit::Signaled
                }
                Script::Play { segments } => {
                    emit(&event_tx, &spool, segments).await;
                    tokio::select! {
                        _ = process.terminate_requested() => ProcessExit::Code(0),
                        _ = process.kill_requested() => ProcessExit::Signaled,
                    }
                }
                Script::PlayThenCrash { segments } => {
                    emit(&event_tx, &spool, segments).await;
                    ProcessExit::Code(1)
                }
                Script::CrashOnStop => {
                    emit(&event_tx, &spool, 0).await;
                    process.terminate_requested().await;
                    ProcessExit::Code(139)
                }
            };
            drop(event_tx);
            let _ = exit_tx.send(exit);
        });

        Ok(TranscoderHandle::new(
            None,
            event_rx,
            exit_rx,
            control,
            request.startup_deadline,
        ))
    }
}

async fn emit(events: &mpsc::Sender<TranscoderEvent>, spool: &Path, segments: usize) {
    let _ = events.send(TranscoderEvent::Connected).await;
    let _ = tokio::fs::create_dir_all(spool).await;
    for i in 0..segments {
        let path = spool.join(format!("seg_{:05}.ts", i));
        if tokio::fs::write(&path, b"mpegts").await.is_ok() {
            let _ = events.send(TranscoderEvent::SegmentCompleted(path)).await;
        }
    }
}

/// Timings small enough for tests.
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        max_concurrent_sessions: 4,
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            max_retries: 3,
        },
        startup_deadline: Duration::from_millis(200),
        stop_grace: Duration::from_millis(300),
        segment_duration: Duration::from_secs(2),
    }
}

pub fn manager(adapter: Arc<FakeAdapter>, root: &Path, config: SupervisorConfig) -> SessionManager {
    let publisher = OutputPublisher::new(PublisherConfig {
        root: root.to_path_buf(),
        public_path: "/streams".to_string(),
        window: 3,
    });
    SessionManager::new(config, publisher, adapter, EventBus::new())
}

/// Poll until the session satisfies `pred`, or give up after `timeout`.
pub async fn wait_until(
    manager: &SessionManager,
    id: &SessionId,
    timeout: Duration,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> Option<SessionSnapshot> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(snapshot) = manager.get(id) {
            if pred(&snapshot) {
                return Some(snapshot);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
