//! Core type definitions shared across the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an output device (one streaming tunnel per device).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Worker identifier (slot index in the pool).
pub type WorkerId = usize;

/// Backpressure signal returned to the audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady,
}

/// Why a chunk was dropped instead of processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Timeout,
    ProcessingFailed,
    /// No stream is open for the device
    StreamClosed,
    ShuttingDown,
}

/// Result of pushing one chunk through the pipeline.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Processed(Bytes),
    Dropped(DropReason),
    /// Nothing was processed; the source should hold off.
    NotReady,
}

impl ProcessOutcome {
    pub fn readiness(&self) -> Readiness {
        match self {
            ProcessOutcome::NotReady => Readiness::NotReady,
            _ => Readiness::Ready,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            ProcessOutcome::Processed(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Why a tuning change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningReason {
    Underrun,
    Overrun,
    Dropout,
    HighCpu,
    HighLatency,
    UnreliableDevice,
    LowPerformance,
    Manual,
}

impl TuningReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TuningReason::Underrun => "underrun",
            TuningReason::Overrun => "overrun",
            TuningReason::Dropout => "dropout",
            TuningReason::HighCpu => "high_cpu",
            TuningReason::HighLatency => "high_latency",
            TuningReason::UnreliableDevice => "unreliable_device",
            TuningReason::LowPerformance => "low_performance",
            TuningReason::Manual => "manual",
        }
    }
}

impl fmt::Display for TuningReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a monotonic instant to wall-clock time for snapshots.
pub(crate) fn wall_clock(at: tokio::time::Instant) -> chrono::DateTime<chrono::Utc> {
    let elapsed = at.elapsed();
    chrono::Utc::now()
        - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
}
