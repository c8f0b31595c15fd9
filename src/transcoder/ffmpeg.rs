//! ffmpeg-backed transcoder.
//!
//! One ffmpeg process per attempt, writing MPEG-TS segments into the
//! session's spool directory. Progress is scraped from stderr.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::adapter::{
    ProcessControl, ProcessExit, StartRequest, TranscoderAdapter, TranscoderEvent,
    TranscoderHandle,
};
use crate::error::SessionError;
use crate::session::{Protocol, ResolvedInput, SessionId};

/// Raw segment file name pattern inside the spool directory.
pub const SPOOL_PATTERN: &str = "seg_%05d.ts";

const EVENT_CAPACITY: usize = 64;
/// Upper bound on draining stderr after the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub ffmpeg_path: PathBuf,
    pub log_level: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub segment_duration: Duration,
    pub io_timeout: Duration,
    pub extra_input_args: Vec<String>,
    pub extra_output_args: Vec<String>,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("/usr/bin/ffmpeg"),
            log_level: "verbose".to_string(),
            video_codec: "h264_v4l2m2m".to_string(),
            audio_codec: "aac".to_string(),
            segment_duration: Duration::from_secs(2),
            io_timeout: Duration::from_secs(30),
            extra_input_args: Vec::new(),
            extra_output_args: Vec::new(),
        }
    }
}

pub struct FfmpegAdapter {
    config: FfmpegConfig,
}

impl FfmpegAdapter {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Full argument list for one attempt.
    pub fn build_args(&self, input: &ResolvedInput, spool_dir: &Path) -> Vec<String> {
        let timeout_us = self.config.io_timeout.as_micros().to_string();
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-y".into(),
            "-loglevel".into(),
            self.config.log_level.clone(),
        ];

        match input.protocol {
            Protocol::Rtsp => {
                args.extend(["-rtsp_transport".into(), "tcp".into()]);
                args.extend(["-timeout".into(), timeout_us]);
            }
            Protocol::Udp => {
                args.extend(["-overrun_nonfatal".into(), "1".into()]);
                args.extend(["-timeout".into(), timeout_us]);
            }
            Protocol::Srt | Protocol::Rtmp | Protocol::Hls | Protocol::Auto => {
                args.extend(["-rw_timeout".into(), timeout_us]);
            }
        }

        args.extend(self.config.extra_input_args.iter().cloned());
        args.extend(["-i".into(), input.url.clone()]);
        args.extend(["-c:v".into(), self.config.video_codec.clone()]);
        args.extend(["-c:a".into(), self.config.audio_codec.clone()]);
        args.extend(self.config.extra_output_args.iter().cloned());
        args.extend([
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            self.config.segment_duration.as_secs().max(1).to_string(),
            "-segment_format".into(),
            "mpegts".into(),
            spool_dir.join(SPOOL_PATTERN).to_string_lossy().into_owned(),
        ]);
        args
    }

    async fn spawn(&self, request: &StartRequest) -> Result<Child> {
        tokio::fs::create_dir_all(&request.spool_dir)
            .await
            .with_context(|| format!("Failed to create spool directory {:?}", request.spool_dir))?;

        let args = self.build_args(&request.input, &request.spool_dir);
        debug!(session_id = %request.session_id, ?args, "Spawning ffmpeg");

        Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.config.ffmpeg_path))
    }
}

#[async_trait]
impl TranscoderAdapter for FfmpegAdapter {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn start(&self, request: &StartRequest) -> Result<TranscoderHandle, SessionError> {
        if request.input.protocol == Protocol::Auto {
            return Err(SessionError::UnsupportedProtocol(format!(
                "unresolved protocol for '{}'",
                request.input.url
            )));
        }

        let mut child = self
            .spawn(request)
            .await
            .map_err(|e| SessionError::TransientFailure(format!("{:#}", e)))?;

        let pid = child.id();
        info!(session_id = %request.session_id, pid = ?pid, protocol = %request.input.protocol, "ffmpeg started");

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let control = ProcessControl::new();
        let reader = match child.stderr.take() {
            Some(stderr) => spawn_stderr_reader(stderr, request.session_id.clone(), event_tx),
            None => tokio::spawn(async {}),
        };
        let stdin = child.stdin.take();
        let exit_rx = spawn_waiter(child, stdin, reader, control.clone(), request.session_id.clone());

        Ok(TranscoderHandle::new(
            pid,
            event_rx,
            exit_rx,
            control,
            request.startup_deadline,
        ))
    }
}

/// Own the child: wait for exit while honouring terminate/kill requests.
fn spawn_waiter(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
    control: ProcessControl,
    session_id: SessionId,
) -> oneshot::Receiver<ProcessExit> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut terminate_sent = false;
        let mut kill_sent = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = control.terminate_requested(), if !terminate_sent => {
                    terminate_sent = true;
                    // ffmpeg's interactive quit command.
                    if let Some(mut pipe) = stdin.take() {
                        if let Err(e) = pipe.write_all(b"q").await {
                            debug!(session_id = %session_id, "Failed to send quit to ffmpeg: {}", e);
                        }
                        let _ = pipe.flush().await;
                    }
                }
                _ = control.kill_requested(), if !kill_sent => {
                    kill_sent = true;
                    if let Err(e) = child.start_kill() {
                        warn!(session_id = %session_id, "Failed to kill ffmpeg: {}", e);
                    }
                }
            }
        };

        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(session_id = %session_id, "stderr reader did not finish after exit");
        }

        let exit = match status {
            Ok(status) => match status.code() {
                Some(code) => ProcessExit::Code(code),
                None => ProcessExit::Signaled,
            },
            Err(e) => ProcessExit::WaitFailed(e.to_string()),
        };
        debug!(session_id = %session_id, ?exit, "ffmpeg exited");
        let _ = tx.send(exit);
    });

    rx
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    session_id: SessionId,
    events: mpsc::Sender<TranscoderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut parser = StderrParser::default();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.contains("Error") || line.contains("error") {
                        warn!(session_id = %session_id, "ffmpeg: {}", line);
                    }
                    for event in parser.feed(&line) {
                        // Keep draining stderr even if nobody listens.
                        let _ = events.send(event).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(session_id = %session_id, "Error reading ffmpeg stderr: {}", e);
                    break;
                }
            }
        }

        if let Some(event) = parser.finish() {
            let _ = events.send(event).await;
        }
    })
}

/// Turns ffmpeg stderr lines into progress events.
#[derive(Debug, Default)]
struct StderrParser {
    /// Segment currently being written.
    open_segment: Option<PathBuf>,
    saw_input: bool,
    connected: bool,
}

impl StderrParser {
    fn feed(&mut self, line: &str) -> Vec<TranscoderEvent> {
        let mut events = Vec::new();

        if !self.connected {
            if line.contains("Input #0") {
                self.saw_input = true;
            } else if self.saw_input && line.contains("Stream #") {
                self.connected = true;
                events.push(TranscoderEvent::Connected);
            }
        }

        if let Some(path) = parse_opening(line) {
            if let Some(done) = self.open_segment.replace(path) {
                events.push(TranscoderEvent::SegmentCompleted(done));
            }
        }

        events
    }

    fn finish(&mut self) -> Option<TranscoderEvent> {
        self.open_segment.take().map(TranscoderEvent::SegmentCompleted)
    }
}

/// Extract the file from `[segment @ 0x..] Opening '<file>' for writing`.
fn parse_opening(line: &str) -> Option<PathBuf> {
    const PREFIX: &str = "Opening '";
    const SUFFIX: &str = "' for writing";

    let start = line.find(PREFIX)? + PREFIX.len();
    let rest = &line[start..];
    let end = rest.find(SUFFIX)?;
    let path = &rest[..end];
    (!path.is_empty()).then(|| PathBuf::from(path))
}
