//! Device health accounting.
//!
//! Tracks two scores per device: a fast-moving `reliability` driven by every
//! probe result and a slow-moving `uptime_score` driven by how fresh the last
//! contact is at each health period. Probe cadence adapts to observed latency.
//! The tracker only does bookkeeping; the probe loops and recovery sequences
//! that feed it are run by the engine.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::engine::types::{wall_clock, DeviceId};
use crate::error::{Error, Result};

/// Notable things that happened to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceEventKind {
    Registered,
    ProbeSucceeded { latency_ms: f64 },
    ProbeFailed { consecutive_failures: u32 },
    RecoveryStarted,
    Recovered,
    RecoveryFailed,
    StreamOpened,
    StreamClosed,
    BufferAdjusted { from: u32, to: u32 },
    TimeoutExtended { timeout_ms: u64 },
    VolumeChanged { volume: u8 },
}

impl DeviceEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEventKind::Registered => "registered",
            DeviceEventKind::ProbeSucceeded { .. } => "probe_succeeded",
            DeviceEventKind::ProbeFailed { .. } => "probe_failed",
            DeviceEventKind::RecoveryStarted => "recovery_started",
            DeviceEventKind::Recovered => "recovered",
            DeviceEventKind::RecoveryFailed => "recovery_failed",
            DeviceEventKind::StreamOpened => "stream_opened",
            DeviceEventKind::StreamClosed => "stream_closed",
            DeviceEventKind::BufferAdjusted { .. } => "buffer_adjusted",
            DeviceEventKind::TimeoutExtended { .. } => "timeout_extended",
            DeviceEventKind::VolumeChanged { .. } => "volume_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHistoryEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event: DeviceEventKind,
}

/// Read-only view of a tracked device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub host: String,
    pub port: u16,
    pub reliability: f64,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub uptime_score: f64,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
    pub healthy: bool,
    pub recovering: bool,
    pub ping_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub history: Vec<DeviceHistoryEntry>,
}

/// What the engine should do after recording a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    Degraded,
    NeedsRecovery,
}

#[derive(Debug)]
struct DeviceRecord {
    host: String,
    port: u16,
    reliability: f64,
    latency_ms: Option<f64>,
    consecutive_failures: u32,
    uptime_score: f64,
    registered_at: Instant,
    last_seen_at: Option<Instant>,
    healthy: bool,
    recovering: bool,
    ping_interval: Duration,
    probe_timeout: Duration,
    history: VecDeque<DeviceHistoryEntry>,
}

impl DeviceRecord {
    fn push_history(&mut self, event: DeviceEventKind, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(DeviceHistoryEntry {
            timestamp: chrono::Utc::now(),
            event,
        });
    }
}

/// Scale a duration, rounded to whole milliseconds.
fn scale(interval: Duration, factor: f64) -> Duration {
    Duration::from_millis((interval.as_millis() as f64 * factor).round() as u64)
}

/// Per-device latency, reliability and uptime accumulator.
pub struct DeviceHealthTracker {
    config: HealthConfig,
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl DeviceHealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            devices: HashMap::new(),
        }
    }

    /// Start tracking a device. Returns false if it was already known.
    pub fn register(&mut self, device: &DeviceId, host: &str, port: u16, now: Instant) -> bool {
        if self.devices.contains_key(device) {
            return false;
        }
        let mut record = DeviceRecord {
            host: host.to_string(),
            port,
            reliability: 100.0,
            latency_ms: None,
            consecutive_failures: 0,
            uptime_score: 100.0,
            registered_at: now,
            last_seen_at: None,
            healthy: true,
            recovering: false,
            ping_interval: Duration::from_millis(self.config.base_interval_ms),
            probe_timeout: Duration::from_millis(self.config.probe_timeout_ms),
            history: VecDeque::new(),
        };
        record.push_history(DeviceEventKind::Registered, self.config.history_capacity);
        self.devices.insert(device.clone(), record);
        info!("Tracking device {} at {}:{}", device, host, port);
        true
    }

    pub fn remove(&mut self, device: &DeviceId) -> bool {
        self.devices.remove(device).is_some()
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.devices.contains_key(device)
    }

    pub fn address(&self, device: &DeviceId) -> Option<(String, u16)> {
        self.devices.get(device).map(|r| (r.host.clone(), r.port))
    }

    /// Record a successful probe and adapt the probe interval.
    pub fn record_success(
        &mut self,
        device: &DeviceId,
        latency: Duration,
        now: Instant,
    ) -> Option<ProbeVerdict> {
        let config = &self.config;
        let record = self.devices.get_mut(device)?;
        let latency_ms = latency.as_secs_f64() * 1000.0;

        record.reliability = (record.reliability + config.reliability_gain).min(100.0);
        record.consecutive_failures = 0;
        record.latency_ms = Some(latency_ms);
        record.last_seen_at = Some(now);
        record.healthy = true;

        let min = Duration::from_millis(config.min_ping_interval_ms);
        let max = Duration::from_millis(config.max_ping_interval_ms);
        if latency_ms < config.fast_latency_ms as f64 {
            record.ping_interval = scale(record.ping_interval, config.grow_factor).min(max);
        } else if latency_ms > config.slow_latency_ms as f64 {
            record.ping_interval = scale(record.ping_interval, config.shrink_factor).max(min);
        }

        record.push_history(
            DeviceEventKind::ProbeSucceeded { latency_ms },
            config.history_capacity,
        );
        debug!(
            "Probe ok for {}: {:.1} ms, reliability {:.0}, next probe in {:?}",
            device, latency_ms, record.reliability, record.ping_interval
        );
        Some(ProbeVerdict::Healthy)
    }

    /// Record a failed probe.
    pub fn record_failure(&mut self, device: &DeviceId, _now: Instant) -> Option<ProbeVerdict> {
        let config = &self.config;
        let record = self.devices.get_mut(device)?;

        record.consecutive_failures += 1;
        record.reliability = (record.reliability - config.reliability_penalty).max(0.0);
        let failures = record.consecutive_failures;
        record.push_history(
            DeviceEventKind::ProbeFailed {
                consecutive_failures: failures,
            },
            config.history_capacity,
        );
        warn!(
            "Probe failed for {} ({} consecutive), reliability {:.0}",
            device, failures, record.reliability
        );

        if failures > config.failure_threshold && !record.recovering {
            Some(ProbeVerdict::NeedsRecovery)
        } else {
            Some(ProbeVerdict::Degraded)
        }
    }

    /// Mark a recovery as running. Returns false if one already is.
    pub fn begin_recovery(&mut self, device: &DeviceId) -> bool {
        let capacity = self.config.history_capacity;
        match self.devices.get_mut(device) {
            Some(record) if !record.recovering => {
                record.recovering = true;
                record.push_history(DeviceEventKind::RecoveryStarted, capacity);
                true
            }
            _ => false,
        }
    }

    /// Close a recovery. A failed recovery leaves the device unhealthy until
    /// a later scheduled probe succeeds.
    pub fn finish_recovery(&mut self, device: &DeviceId, recovered: bool) {
        let capacity = self.config.history_capacity;
        if let Some(record) = self.devices.get_mut(device) {
            record.recovering = false;
            if recovered {
                record.push_history(DeviceEventKind::Recovered, capacity);
            } else {
                record.healthy = false;
                record.push_history(DeviceEventKind::RecoveryFailed, capacity);
            }
        }
    }

    /// Apply one health period of uptime accounting to every device.
    pub fn tick_uptime(&mut self, now: Instant) {
        let stale = Duration::from_millis(self.config.contact_stale_ms);
        for record in self.devices.values_mut() {
            let reference = record.last_seen_at.unwrap_or(record.registered_at);
            if now.saturating_duration_since(reference) > stale {
                record.uptime_score = (record.uptime_score - self.config.uptime_decay).max(0.0);
            } else {
                record.uptime_score =
                    (record.uptime_score + self.config.uptime_recovery).min(100.0);
            }
        }
    }

    pub fn note(&mut self, device: &DeviceId, event: DeviceEventKind) {
        let capacity = self.config.history_capacity;
        if let Some(record) = self.devices.get_mut(device) {
            record.push_history(event, capacity);
        }
    }

    pub fn reliability(&self, device: &DeviceId) -> Option<f64> {
        self.devices.get(device).map(|r| r.reliability)
    }

    pub fn ping_interval(&self, device: &DeviceId) -> Option<Duration> {
        self.devices.get(device).map(|r| r.ping_interval)
    }

    pub fn probe_timeout(&self, device: &DeviceId) -> Option<Duration> {
        self.devices.get(device).map(|r| r.probe_timeout)
    }

    /// Mean reliability over tracked devices, `None` when there are none.
    pub fn mean_reliability(&self) -> Option<f64> {
        if self.devices.is_empty() {
            return None;
        }
        let total: f64 = self.devices.values().map(|r| r.reliability).sum();
        Some(total / self.devices.len() as f64)
    }

    /// Lowest reliability over tracked devices.
    pub fn min_reliability(&self) -> Option<f64> {
        self.devices.values().map(|r| r.reliability).reduce(f64::min)
    }

    /// Mean of the last observed latencies, `None` without any probe data.
    pub fn mean_latency(&self) -> Option<f64> {
        let latencies: Vec<f64> = self.devices.values().filter_map(|r| r.latency_ms).collect();
        if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        }
    }

    /// Devices whose reliability is below `threshold`.
    pub fn unreliable(&self, threshold: f64) -> Vec<(DeviceId, f64, u64)> {
        let mut found: Vec<_> = self
            .devices
            .iter()
            .filter(|(_, r)| r.reliability < threshold)
            .map(|(id, r)| (id.clone(), r.reliability, r.probe_timeout.as_millis() as u64))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub fn base_interval_ms(&self) -> u64 {
        self.config.base_interval_ms
    }

    /// Change the base probe interval, rescaling every device's current
    /// interval by the same ratio within the configured bounds.
    pub fn set_base_interval(&mut self, interval_ms: u64) -> Result<()> {
        let min = self.config.min_ping_interval_ms;
        let max = self.config.max_ping_interval_ms;
        if interval_ms < min || interval_ms > max {
            return Err(Error::TuningError(format!(
                "health interval {} ms outside {}..={} ms",
                interval_ms, min, max
            )));
        }
        let ratio = interval_ms as f64 / self.config.base_interval_ms.max(1) as f64;
        self.config.base_interval_ms = interval_ms;
        for record in self.devices.values_mut() {
            record.ping_interval = scale(record.ping_interval, ratio)
                .clamp(Duration::from_millis(min), Duration::from_millis(max));
        }
        Ok(())
    }

    /// Set a device's probe timeout, bounded by `max_probe_timeout_ms`.
    pub fn set_probe_timeout(&mut self, device: &DeviceId, timeout_ms: u64) -> Result<u64> {
        let capacity = self.config.history_capacity;
        let max = self.config.max_probe_timeout_ms;
        let record = self
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
        let timeout_ms = timeout_ms.clamp(1, max);
        record.probe_timeout = Duration::from_millis(timeout_ms);
        record.push_history(DeviceEventKind::TimeoutExtended { timeout_ms }, capacity);
        Ok(timeout_ms)
    }

    pub fn snapshot(&self, device: &DeviceId) -> Option<DeviceSnapshot> {
        self.devices.get(device).map(|r| Self::to_snapshot(device, r))
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<_> = self
            .devices
            .iter()
            .map(|(id, r)| Self::to_snapshot(id, r))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn to_snapshot(id: &DeviceId, r: &DeviceRecord) -> DeviceSnapshot {
        DeviceSnapshot {
            id: id.clone(),
            host: r.host.clone(),
            port: r.port,
            reliability: r.reliability,
            latency_ms: r.latency_ms,
            consecutive_failures: r.consecutive_failures,
            uptime_score: r.uptime_score,
            last_seen_at: r.last_seen_at.map(wall_clock),
            healthy: r.healthy,
            recovering: r.recovering,
            ping_interval_ms: r.ping_interval.as_millis() as u64,
            probe_timeout_ms: r.probe_timeout.as_millis() as u64,
            history: r.history.iter().cloned().collect(),
        }
    }
}
