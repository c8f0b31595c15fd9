use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::{ResolvedInput, SessionId};

/// Everything an adapter needs to launch one attempt.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: SessionId,
    pub input: ResolvedInput,
    /// Directory the transcoder writes raw segments into.
    pub spool_dir: PathBuf,
    /// Maximum time to first observable output.
    pub startup_deadline: Duration,
}

/// Uniform contract over one external transcoding process.
///
/// Implementations only report outcomes. Retry policy belongs to the
/// supervisor.
#[async_trait]
pub trait TranscoderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Launch one attempt.
    ///
    /// `UnsupportedProtocol`/`InvalidInput` are configuration failures and
    /// are never retried. Anything else should be `TransientFailure`.
    async fn start(&self, request: &StartRequest) -> Result<TranscoderHandle, SessionError>;
}

/// Progress reported by a running transcoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderEvent {
    /// Input opened and its streams listed.
    Connected,
    /// A segment file has been fully written.
    SegmentCompleted(PathBuf),
}

/// Raw process exit, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    Signaled,
    WaitFailed(String),
}

/// Normalized outcome of an attempt. Raw codes never leave the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit following a requested stop, whatever the status.
    Clean,
    /// Non-zero or otherwise unexpected exit.
    Crashed { reason: String },
    /// No output within the startup deadline.
    TimedOut,
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("stopped"),
            Self::Crashed { reason } => f.write_str(reason),
            Self::TimedOut => f.write_str("no output within startup deadline"),
        }
    }
}

/// Termination requests shared between a handle and the task that owns the
/// child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessControl {
    terminate: CancellationToken,
    kill: CancellationToken,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the process to exit on its own.
    pub fn request_terminate(&self) {
        self.terminate.cancel();
    }

    /// Force the process down.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub async fn terminate_requested(&self) {
        self.terminate.cancelled().await
    }

    pub async fn kill_requested(&self) {
        self.kill.cancelled().await
    }
}

/// What [`TranscoderHandle::next`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    Output(TranscoderEvent),
    Exited(ExitClass),
}

/// Handle to one running attempt.
///
/// Dropping a handle whose process has not been observed to exit kills it,
/// so a session never leaks a second process.
pub struct TranscoderHandle {
    pid: Option<u32>,
    events: mpsc::Receiver<TranscoderEvent>,
    events_closed: bool,
    exit: oneshot::Receiver<ProcessExit>,
    exited: Option<ExitClass>,
    control: ProcessControl,
    /// Cleared on first output.
    deadline: Option<Instant>,
    timed_out: bool,
}

impl TranscoderHandle {
    pub fn new(
        pid: Option<u32>,
        events: mpsc::Receiver<TranscoderEvent>,
        exit: oneshot::Receiver<ProcessExit>,
        control: ProcessControl,
        startup_deadline: Duration,
    ) -> Self {
        Self {
            pid,
            events,
            events_closed: false,
            exit,
            exited: None,
            control,
            deadline: Some(Instant::now() + startup_deadline),
            timed_out: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output event or the classified exit.
    ///
    /// Pending output is always delivered before the exit. Once the exit has
    /// been returned, every further call returns it again. Cancel safe.
    pub async fn next(&mut self) -> HandleEvent {
        if let Some(class) = &self.exited {
            return HandleEvent::Exited(class.clone());
        }

        loop {
            let deadline = self.deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                event = self.events.recv(), if !self.events_closed => match event {
                    Some(event) => {
                        self.deadline = None;
                        return HandleEvent::Output(event);
                    }
                    None => self.events_closed = true,
                },

                exit = &mut self.exit => {
                    let exit = exit.unwrap_or_else(|_| {
                        ProcessExit::WaitFailed("exit status channel closed".to_string())
                    });
                    let class = self.classify(exit);
                    self.exited = Some(class.clone());
                    return HandleEvent::Exited(class);
                }

                _ = tokio::time::sleep_until(deadline), if self.deadline.is_some() && !self.timed_out => {
                    warn!(pid = ?self.pid, "Transcoder produced no output before the startup deadline, killing");
                    self.timed_out = true;
                    self.control.kill();
                }
            }
        }
    }

    /// Wait for the process to exit, discarding further output.
    pub async fn wait(&mut self) -> ExitClass {
        loop {
            if let HandleEvent::Exited(class) = self.next().await {
                return class;
            }
        }
    }

    /// Request graceful termination, escalating to a kill after `grace`.
    pub async fn stop(&mut self, grace: Duration) -> ExitClass {
        self.control.request_terminate();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(class) => class,
            Err(_) => {
                warn!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "Transcoder ignored graceful stop, killing");
                self.control.kill();
                self.wait().await
            }
        }
    }

    fn classify(&self, exit: ProcessExit) -> ExitClass {
        if self.control.stop_requested() {
            debug!(pid = ?self.pid, ?exit, "Transcoder exited after stop request");
            return ExitClass::Clean;
        }
        if self.timed_out {
            return ExitClass::TimedOut;
        }

        match exit {
            ProcessExit::Code(0) => ExitClass::Crashed {
                reason: "transcoder exited unexpectedly".to_string(),
            },
            ProcessExit::Code(code) => {
                warn!(pid = ?self.pid, code, "Transcoder exited with error status");
                ExitClass::Crashed {
                    reason: "transcoder process crashed".to_string(),
                }
            }
            ProcessExit::Signaled => {
                warn!(pid = ?self.pid, "Transcoder terminated by signal");
                ExitClass::Crashed {
                    reason: "transcoder process was terminated".to_string(),
                }
            }
            ProcessExit::WaitFailed(error) => {
                warn!(pid = ?self.pid, %error, "Lost track of transcoder process");
                ExitClass::Crashed {
                    reason: "transcoder process could not be monitored".to_string(),
                }
            }
        }
    }
}

impl Drop for TranscoderHandle {
    fn drop(&mut self) {
        if self.exited.is_none() {
            self.control.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(deadline: Duration) -> (
        TranscoderHandle,
        mpsc::Sender<TranscoderEvent>,
        oneshot::Sender<ProcessExit>,
        ProcessControl,
    ) {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = oneshot::channel();
        let control = ProcessControl::new();
        let handle = TranscoderHandle::new(Some(42), event_rx, exit_rx, control.clone(), deadline);
        (handle, event_tx, exit_tx, control)
    }

    #[tokio::test]
    async fn test_output_before_exit() {
        let (mut handle, events, exit, _control) = handle(Duration::from_secs(5));
        events.send(TranscoderEvent::Connected).await.unwrap();
        exit.send(ProcessExit::Code(1)).unwrap();

        assert_eq!(handle.next().await, HandleEvent::Output(TranscoderEvent::Connected));
        assert!(matches!(
            handle.next().await,
            HandleEvent::Exited(ExitClass::Crashed { .. })
        ));
    }

    #[tokio::test]
    async fn test_requested_stop_is_clean() {
        let (mut handle, _events, exit, control) = handle(Duration::from_secs(5));
        tokio::spawn(async move {
            control.terminate_requested().await;
            let _ = exit.send(ProcessExit::Code(255));
        });

        assert_eq!(handle.stop(Duration::from_secs(1)).await, ExitClass::Clean);
    }

    #[tokio::test]
    async fn test_startup_deadline_kills_and_times_out() {
        let (mut handle, _events, exit, control) = handle(Duration::from_millis(20));
        tokio::spawn(async move {
            control.kill_requested().await;
            let _ = exit.send(ProcessExit::Signaled);
        });

        assert_eq!(handle.wait().await, ExitClass::TimedOut);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let (mut handle, _events, exit, control) = handle(Duration::from_secs(5));
        tokio::spawn(async move {
            // Ignores the graceful request.
            control.kill_requested().await;
            let _ = exit.send(ProcessExit::Signaled);
        });

        assert_eq!(handle.stop(Duration::from_millis(20)).await, ExitClass::Clean);
    }

    #[test]
    fn test_drop_kills_running_process() {
        let (handle, _events, _exit, control) = handle(Duration::from_secs(5));
        drop(handle);
        assert!(control.kill.is_cancelled());
    }
}
