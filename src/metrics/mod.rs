//! Metrics Sampler
//!
//! Periodic host telemetry, independent of sessions. Each field is sampled
//! on its own; a metric the host cannot provide is left out of the snapshot.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{Event, EventBus};

/// Point-in-time host telemetry. Absent fields could not be sampled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f32>,
}

/// Latest snapshot, shared with readers.
pub type LatestMetrics = Arc<RwLock<Option<MetricsSnapshot>>>;

pub struct MetricsSampler {
    system: Mutex<System>,
    thermal_zone: PathBuf,
    disk_path: PathBuf,
}

impl MetricsSampler {
    pub fn new(thermal_zone: impl Into<PathBuf>, disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        // CPU usage is a delta; prime it so the first tick is meaningful.
        system.refresh_cpu_all();

        Self {
            system: Mutex::new(system),
            thermal_zone: thermal_zone.into(),
            disk_path: disk_path.into(),
        }
    }

    /// Take one snapshot. Never fails as a whole.
    pub fn sample(&self) -> MetricsSnapshot {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu_all();
            system.refresh_memory();

            let cpu = (!system.cpus().is_empty()).then(|| system.global_cpu_usage());
            let total = system.total_memory();
            let memory =
                (total > 0).then(|| (system.used_memory() as f64 / total as f64 * 100.0) as f32);
            (cpu, memory)
        };

        let temperature_celsius = read_temperature(&self.thermal_zone)
            .map_err(|e| debug!("Temperature unavailable: {:#}", e))
            .ok();

        let disk_percent = disk_usage(&self.disk_path);
        if disk_percent.is_none() {
            debug!("Disk usage unavailable for {:?}", self.disk_path);
        }

        MetricsSnapshot {
            cpu_percent,
            memory_percent,
            temperature_celsius,
            disk_percent,
        }
    }

    /// Sample every `interval` until `shutdown`, caching the latest snapshot
    /// and publishing it on the bus.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        bus: EventBus,
        latest: LatestMetrics,
        shutdown: CancellationToken,
    ) {
        info!("Metrics sampler started (every {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sampler = Arc::clone(&self);
            let snapshot = match tokio::task::spawn_blocking(move || sampler.sample()).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!("Metrics sampling task failed: {}", e);
                    continue;
                }
            };

            *latest.write() = Some(snapshot.clone());
            bus.publish(Event::metrics(snapshot));
        }

        info!("Metrics sampler stopped");
    }
}

/// Thermal zone files report millidegrees Celsius.
pub fn read_temperature(path: &Path) -> Result<f32> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let millis: f32 = raw
        .trim()
        .parse()
        .with_context(|| format!("Unexpected thermal zone contents {:?}", raw.trim()))?;
    Ok(millis / 1000.0)
}

/// Used space of the disk holding `path`, in percent.
fn disk_usage(path: &Path) -> Option<f32> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();

    // Longest mount point containing the path.
    let disk = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;

    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(disk.available_space());
    Some((used as f64 / total as f64 * 100.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fields_are_omitted() {
        let snapshot = MetricsSnapshot {
            cpu_percent: Some(12.5),
            ..MetricsSnapshot::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["cpu_percent"], 12.5);
        assert!(json.get("temperature_celsius").is_none());
    }

    #[test]
    fn test_read_temperature_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "hot\n").unwrap();
        assert!(read_temperature(&path).is_err());
    }
}
