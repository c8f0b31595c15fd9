// Integration tests for the ffmpeg-backed transcoder
//
// A small shell script stands in for ffmpeg: it prints the stderr lines the
// adapter parses, writes segment files into the spool, then either honours
// the quit command on stdin or ignores it.

#![cfg(unix)]

mod common;

use anyhow::Result;
use common::wait_until;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vplayer::{
    EventBus, FfmpegAdapter, FfmpegConfig, OutputPublisher, PublisherConfig, SessionManager,
    SessionState, StreamInput, SupervisorConfig,
};

const WAIT: Duration = Duration::from_secs(10);

/// Prints the input banner and opens `segments` files, so `segments - 1` of
/// them are complete while the process keeps running.
fn fake_ffmpeg(dir: &Path, segments: usize, tail: &str) -> Result<PathBuf> {
    let script = format!(
        r#"#!/bin/sh
for last in "$@"; do :; done
spool=$(dirname "$last")
echo "Input #0, mpegts, from 'srt://host:1234':" >&2
echo "  Stream #0:0[0x100]: Video: h264" >&2
n=0
while [ "$n" -lt {segments} ]; do
  seg="$spool/seg_0000$n.ts"
  printf 'mpegts' > "$seg"
  echo "[segment @ 0x1] Opening '$seg' for writing" >&2
  n=$((n + 1))
done
{tail}
"#
    );
    let path = dir.join("ffmpeg");
    fs::write(&path, script)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn ffmpeg_manager(root: &Path, ffmpeg_path: PathBuf, stop_grace: Duration) -> SessionManager {
    let config = SupervisorConfig {
        startup_deadline: Duration::from_secs(5),
        stop_grace,
        ..SupervisorConfig::default()
    };
    let publisher = OutputPublisher::new(PublisherConfig {
        root: root.to_path_buf(),
        public_path: "/streams".to_string(),
        window: 3,
    });
    let adapter = FfmpegAdapter::new(FfmpegConfig {
        ffmpeg_path,
        ..FfmpegConfig::default()
    });
    SessionManager::new(config, publisher, Arc::new(adapter), EventBus::new())
}

#[tokio::test]
async fn test_segments_published_and_quit_on_stop() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let root = temp_dir.path().join("streams");
    let marker = temp_dir.path().join("quit");
    let tail = format!("read -r cmd\nprintf '%s' \"$cmd\" > '{}'\nexit 0", marker.display());
    let ffmpeg = fake_ffmpeg(temp_dir.path(), 5, &tail)?;
    let manager = ffmpeg_manager(&root, ffmpeg, Duration::from_secs(2));

    let id = manager.start(StreamInput::auto("srt://host:1234")).await?.id;
    wait_until(&manager, &id, WAIT, |s| s.state == SessionState::Playing)
        .await
        .expect("stream info should move the session to PLAYING");

    // Four segments complete; the window keeps the newest three.
    let deadline = Instant::now() + WAIT;
    let mut segments = Vec::new();
    while Instant::now() < deadline {
        segments = manager.publisher().segments(&id).await;
        if segments.last().map(|s| s.sequence) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sequences: Vec<u64> = segments.iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let session_dir = root.join(id.as_str());
    assert!(!session_dir.join("segment_000000.ts").exists());
    assert!(session_dir.join("segment_000003.ts").exists());
    let playlist = fs::read_to_string(session_dir.join("index.m3u8"))?;
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:1"));

    let ack = manager.stop(&id).await?;
    assert_eq!(ack.state, SessionState::Stopped);
    assert!(ack.completed);
    assert_eq!(fs::read_to_string(&marker)?, "q");
    assert!(!session_dir.exists());

    let snapshot = manager.get(&id);
    assert!(snapshot.is_err());
    Ok(())
}

#[tokio::test]
async fn test_stop_kills_transcoder_that_ignores_quit() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let root = temp_dir.path().join("streams");
    // Replaces the shell so the kill reaches the process holding stderr.
    let ffmpeg = fake_ffmpeg(temp_dir.path(), 1, "exec sleep 30")?;
    let grace = Duration::from_millis(200);
    let manager = ffmpeg_manager(&root, ffmpeg, grace);

    let id = manager.start(StreamInput::auto("srt://host:1234")).await?.id;
    wait_until(&manager, &id, WAIT, |s| s.state == SessionState::Playing)
        .await
        .expect("stream info should move the session to PLAYING");

    let started = Instant::now();
    let ack = manager.stop(&id).await?;
    assert_eq!(ack.state, SessionState::Stopped);
    assert!(ack.completed);
    assert!(started.elapsed() >= grace);
    assert!(!root.join(id.as_str()).exists());
    Ok(())
}
