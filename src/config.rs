use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::output::PublisherConfig;
use crate::supervisor::{BackoffPolicy, SupervisorConfig};
use crate::transcoder::FfmpegConfig;

/// Environment variable prefix, e.g. `VPLAYER__SESSIONS__MAX_RETRIES=3`.
pub const ENV_PREFIX: &str = "VPLAYER";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub sessions: SessionsConfig,
    pub transcoder: TranscoderConfig,
    pub output: OutputConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "vplayer".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_concurrent_sessions: usize,
    pub max_retries: u32,
    pub startup_deadline_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub stop_grace_ms: u64,
    /// How long FAILED/STOPPED sessions stay listed
    pub retention_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            max_retries: 5,
            startup_deadline_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            stop_grace_ms: 5_000,
            retention_secs: 300,
            gc_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_path: String,
    pub log_level: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub segment_duration_secs: u64,
    pub io_timeout_secs: u64,
    pub extra_input_args: Vec<String>,
    pub extra_output_args: Vec<String>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        let ffmpeg = FfmpegConfig::default();
        Self {
            ffmpeg_path: ffmpeg.ffmpeg_path.to_string_lossy().into_owned(),
            log_level: ffmpeg.log_level,
            video_codec: ffmpeg.video_codec,
            audio_codec: ffmpeg.audio_codec,
            segment_duration_secs: ffmpeg.segment_duration.as_secs(),
            io_timeout_secs: ffmpeg.io_timeout.as_secs(),
            extra_input_args: Vec::new(),
            extra_output_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Supports `~` and `$VAR`
    pub root: String,
    pub public_path: String,
    /// Segments kept per session
    pub window: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: "/tmp/vplayer/streams".to_string(),
            public_path: "/streams".to_string(),
            window: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    pub thermal_zone: String,
    pub disk_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            thermal_zone: "/sys/class/thermal/thermal_zone0/temp".to_string(),
            disk_path: "/".to_string(),
        }
    }
}

impl Config {
    /// Load from an optional file at `path` (extension inferred), then
    /// `VPLAYER__*` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path))?;

        let cfg: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sessions.max_concurrent_sessions == 0 {
            bail!("sessions.max_concurrent_sessions must be at least 1");
        }
        if self.output.window == 0 {
            bail!("output.window must be at least 1");
        }
        if self.transcoder.segment_duration_secs == 0 {
            bail!("transcoder.segment_duration_secs must be at least 1");
        }
        if self.sessions.backoff_cap_ms < self.sessions.backoff_base_ms {
            bail!("sessions.backoff_cap_ms must not be below sessions.backoff_base_ms");
        }
        let public_path = &self.output.public_path;
        if !public_path.starts_with('/') || public_path.trim_end_matches('/').is_empty() {
            bail!("output.public_path must be a non-root path starting with '/'");
        }
        Ok(())
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        let s = &self.sessions;
        SupervisorConfig {
            max_concurrent_sessions: s.max_concurrent_sessions,
            backoff: BackoffPolicy {
                base: Duration::from_millis(s.backoff_base_ms),
                cap: Duration::from_millis(s.backoff_cap_ms),
                max_retries: s.max_retries,
            },
            startup_deadline: Duration::from_millis(s.startup_deadline_ms),
            stop_grace: Duration::from_millis(s.stop_grace_ms),
            segment_duration: Duration::from_secs(self.transcoder.segment_duration_secs),
        }
    }

    pub fn ffmpeg(&self) -> FfmpegConfig {
        let t = &self.transcoder;
        FfmpegConfig {
            ffmpeg_path: PathBuf::from(&t.ffmpeg_path),
            log_level: t.log_level.clone(),
            video_codec: t.video_codec.clone(),
            audio_codec: t.audio_codec.clone(),
            segment_duration: Duration::from_secs(t.segment_duration_secs),
            io_timeout: Duration::from_secs(t.io_timeout_secs),
            extra_input_args: t.extra_input_args.clone(),
            extra_output_args: t.extra_output_args.clone(),
        }
    }

    pub fn publisher(&self) -> Result<PublisherConfig> {
        let root = shellexpand::full(&self.output.root)
            .with_context(|| format!("Failed to expand output.root {:?}", self.output.root))?;
        Ok(PublisherConfig {
            root: PathBuf::from(root.as_ref()),
            public_path: self.output.public_path.clone(),
            window: self.output.window,
        })
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.gc_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.sessions.retention_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.interval_secs.max(1))
    }
}
