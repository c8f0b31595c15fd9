//! Output Publisher
//!
//! Owns `<root>/<session_id>/`: a spool directory the transcoder writes into,
//! a bounded window of published segments and the `index.m3u8` listing them.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::session::SessionId;

pub const PLAYLIST_NAME: &str = "index.m3u8";
const SPOOL_DIR: &str = "spool";

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Directory holding one subdirectory per session
    pub root: PathBuf,
    /// URL prefix under which `root` is served
    pub public_path: String,
    /// Number of segments kept per session
    pub window: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/vplayer/streams"),
            public_path: "/streams".to_string(),
            window: 3,
        }
    }
}

/// A finished segment handed over by the supervisor.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Where the transcoder wrote it
    pub path: PathBuf,
    pub duration: Duration,
    /// First segment of a restarted attempt
    pub discontinuity: bool,
}

/// A segment currently listed in the playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedSegment {
    pub sequence: u64,
    pub file_name: String,
    pub duration: Duration,
    pub discontinuity: bool,
}

struct SegmentWindow {
    dir: PathBuf,
    /// Never reset within a session.
    next_sequence: u64,
    /// Discontinuity tags that have scrolled out of the window.
    discontinuity_sequence: u64,
    segments: VecDeque<PublishedSegment>,
    closed: bool,
}

impl SegmentWindow {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            next_sequence: 0,
            discontinuity_sequence: 0,
            segments: VecDeque::new(),
            closed: false,
        }
    }

    fn render_playlist(&self) -> String {
        let target = self
            .segments
            .iter()
            .map(|s| s.duration.as_secs_f64().ceil() as u64)
            .max()
            .unwrap_or(1)
            .max(1);
        let media_sequence = self
            .segments
            .front()
            .map_or(self.next_sequence, |s| s.sequence);

        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:3");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", media_sequence);
        let _ = writeln!(out, "#EXT-X-DISCONTINUITY-SEQUENCE:{}", self.discontinuity_sequence);
        for segment in &self.segments {
            if segment.discontinuity {
                let _ = writeln!(out, "#EXT-X-DISCONTINUITY");
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration.as_secs_f64());
            let _ = writeln!(out, "{}", segment.file_name);
        }
        out
    }

    /// Temp file + rename so readers never see a partial playlist.
    async fn write_playlist(&self) -> Result<()> {
        let path = self.dir.join(PLAYLIST_NAME);
        let tmp = self.dir.join(format!("{}.tmp", PLAYLIST_NAME));
        tokio::fs::write(&tmp, self.render_playlist())
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }
}

/// Per-session output manager.
///
/// Ingest for one session is serialized by that session's window lock;
/// different sessions never share a lock or a directory.
pub struct OutputPublisher {
    config: PublisherConfig,
    windows: DashMap<SessionId, Arc<Mutex<SegmentWindow>>>,
}

impl OutputPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn public_path(&self) -> &str {
        &self.config.public_path
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.config.root.join(id.as_str())
    }

    pub fn spool_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(SPOOL_DIR)
    }

    pub fn output_ref(&self, id: &SessionId) -> String {
        format!(
            "{}/{}/{}",
            self.config.public_path.trim_end_matches('/'),
            id,
            PLAYLIST_NAME
        )
    }

    /// Prepare the session directory and an empty playlist.
    pub async fn open(&self, id: &SessionId) -> Result<String> {
        let dir = self.session_dir(id);
        tokio::fs::create_dir_all(dir.join(SPOOL_DIR))
            .await
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;

        let window = Arc::clone(
            self.windows
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SegmentWindow::new(dir.clone()))))
                .value(),
        );
        window.lock().await.write_playlist().await?;

        info!(session_id = %id, "Output opened at {:?}", dir);
        Ok(self.output_ref(id))
    }

    /// Publish a finished segment, evicting the oldest beyond the window.
    pub async fn ingest(&self, id: &SessionId, segment: Segment) -> Result<PublishedSegment> {
        let window = self
            .windows
            .get(id)
            .map(|w| Arc::clone(w.value()))
            .with_context(|| format!("No open output for session {}", id))?;
        let mut window = window.lock().await;
        if window.closed {
            bail!("Output for session {} is closed", id);
        }

        let sequence = window.next_sequence;
        let file_name = format!("segment_{:06}.ts", sequence);
        let target = window.dir.join(&file_name);
        tokio::fs::rename(&segment.path, &target)
            .await
            .with_context(|| format!("Failed to publish {:?}", segment.path))?;
        window.next_sequence += 1;

        let published = PublishedSegment {
            sequence,
            file_name,
            duration: segment.duration,
            discontinuity: segment.discontinuity,
        };
        window.segments.push_back(published.clone());

        while window.segments.len() > self.config.window {
            let Some(evicted) = window.segments.pop_front() else {
                break;
            };
            if evicted.discontinuity {
                window.discontinuity_sequence += 1;
            }
            let path = window.dir.join(&evicted.file_name);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(session_id = %id, "Failed to delete evicted segment {:?}: {}", path, e);
            }
        }

        window.write_playlist().await?;
        debug!(session_id = %id, sequence, "Segment published");
        Ok(published)
    }

    /// Remove every artifact for the session. Idempotent.
    pub async fn close(&self, id: &SessionId) -> Result<()> {
        if let Some((_, window)) = self.windows.remove(id) {
            window.lock().await.closed = true;
        }

        let dir = self.session_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(session_id = %id, "Output removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", dir)),
        }
    }

    /// Segments currently listed for the session, oldest first.
    pub async fn segments(&self, id: &SessionId) -> Vec<PublishedSegment> {
        let Some(window) = self.windows.get(id).map(|w| Arc::clone(w.value())) else {
            return Vec::new();
        };
        let window = window.lock().await;
        window.segments.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published(sequence: u64, secs: f64, discontinuity: bool) -> PublishedSegment {
        PublishedSegment {
            sequence,
            file_name: format!("segment_{:06}.ts", sequence),
            duration: Duration::from_secs_f64(secs),
            discontinuity,
        }
    }

    #[test]
    fn test_empty_playlist() {
        let window = SegmentWindow::new(PathBuf::from("/x"));
        let playlist = window.render_playlist();
        assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:1\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(!playlist.contains("#EXTINF"));
    }

    #[test]
    fn test_playlist_lists_window() {
        let mut window = SegmentWindow::new(PathBuf::from("/x"));
        window.next_sequence = 7;
        window.discontinuity_sequence = 1;
        window.segments.push_back(published(4, 2.0, false));
        window.segments.push_back(published(5, 2.4, true));
        window.segments.push_back(published(6, 1.9, false));

        let playlist = window.render_playlist();
        assert!(playlist.contains("#EXT-X-TARGETDURATION:3\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:4\n"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY-SEQUENCE:1\n"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY\n#EXTINF:2.400,\nsegment_000005.ts\n"));
        assert!(playlist.ends_with("#EXTINF:1.900,\nsegment_000006.ts\n"));
    }

    #[test]
    fn test_output_ref_joins_public_path() {
        let publisher = OutputPublisher::new(PublisherConfig {
            public_path: "/streams/".to_string(),
            ..PublisherConfig::default()
        });
        let id = SessionId::parse("abc123").unwrap();
        assert_eq!(publisher.output_ref(&id), "/streams/abc123/index.m3u8");
    }
}
