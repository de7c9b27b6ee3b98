//! Closed-loop auto-tuning.
//!
//! The optimizer cycles through `Idle -> Evaluating -> Applying ->
//! Stabilizing -> Idle`. It only leaves `Idle` when no cooldown is running
//! and no stabilization window is open, so opposing changes cannot chase
//! each other. It never touches components directly: it computes a bounded
//! change set and hands it to a `TuningTarget`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::types::{DeviceId, TuningReason};
use crate::config::TuningConfig;
use crate::error::Result;
use crate::scoring::{PerformanceScore, SubScore};

/// One bounded change to live configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "parameter", rename_all = "snake_case")]
pub enum ParameterChange {
    WorkerCount {
        from: usize,
        to: usize,
    },
    BufferRange {
        from_min: u32,
        from_max: u32,
        to_min: u32,
        to_max: u32,
    },
    HealthInterval {
        from_ms: u64,
        to_ms: u64,
    },
    ProbeTimeout {
        device: DeviceId,
        from_ms: u64,
        to_ms: u64,
    },
    /// Recorded by the buffer controller; never proposed by the optimizer
    BufferSize {
        device: DeviceId,
        from: u32,
        to: u32,
    },
}

impl ParameterChange {
    pub fn describe(&self) -> String {
        match self {
            ParameterChange::WorkerCount { from, to } => format!("workers {} -> {}", from, to),
            ParameterChange::BufferRange {
                from_min,
                from_max,
                to_min,
                to_max,
            } => format!(
                "buffer range {}..{} -> {}..{} ms",
                from_min, from_max, to_min, to_max
            ),
            ParameterChange::HealthInterval { from_ms, to_ms } => {
                format!("health interval {} -> {} ms", from_ms, to_ms)
            }
            ParameterChange::ProbeTimeout {
                device,
                from_ms,
                to_ms,
            } => format!("probe timeout for {} {} -> {} ms", device, from_ms, to_ms),
            ParameterChange::BufferSize { device, from, to } => {
                format!("buffer for {} {} -> {} ms", device, from, to)
            }
        }
    }
}

/// Audit record of a tuning decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub reason: TuningReason,
    pub changes: Vec<ParameterChange>,
    pub success: bool,
    pub error: Option<String>,
}

impl TuningEvent {
    pub fn new(reason: TuningReason, changes: Vec<ParameterChange>, error: Option<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            reason,
            changes,
            success: error.is_none(),
            error,
        }
    }
}

/// Append-only bounded audit log.
#[derive(Debug)]
pub struct TuningLog {
    events: VecDeque<TuningEvent>,
    capacity: usize,
}

impl TuningLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: TuningEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn events(&self) -> Vec<TuningEvent> {
        self.events.iter().cloned().collect()
    }
}

/// Live values and their clamps, as seen by the optimizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunableParams {
    pub worker_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub buffer_min: u32,
    pub buffer_max: u32,
    pub buffer_floor: u32,
    pub buffer_ceiling: u32,
    pub health_interval_ms: u64,
    pub max_health_interval_ms: u64,
    pub max_probe_timeout_ms: u64,
    /// (device, reliability, probe timeout in ms)
    pub devices: Vec<(DeviceId, f64, u64)>,
}

/// Where tuning changes are read from and written to.
pub trait TuningTarget {
    fn current(&self) -> TunableParams;
    fn apply(&self, change: &ParameterChange) -> Result<()>;
}

/// Observations fed to each tick.
#[derive(Debug, Clone, Default)]
pub struct TuningSignals {
    pub cpu_percent: f64,
    pub mean_latency_ms: Option<f64>,
    pub min_reliability: Option<f64>,
    pub score: Option<PerformanceScore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TuningPhase {
    Idle,
    Evaluating,
    Applying,
    Stabilizing {
        #[serde(skip)]
        until: Option<Instant>,
    },
}

const TICK_REASONS: [TuningReason; 4] = [
    TuningReason::HighCpu,
    TuningReason::HighLatency,
    TuningReason::UnreliableDevice,
    TuningReason::LowPerformance,
];

/// Auto-tuning state machine.
pub struct AutoTuningOptimizer {
    config: TuningConfig,
    phase: TuningPhase,
    last_adjustment_at: Option<Instant>,
    streaks: HashMap<TuningReason, u32>,
    /// Set after a failed apply; explicit triggers wait for the next tick
    blocked_until_tick: bool,
}

impl AutoTuningOptimizer {
    pub fn new(config: TuningConfig) -> Self {
        Self {
            config,
            phase: TuningPhase::Idle,
            last_adjustment_at: None,
            streaks: HashMap::new(),
            blocked_until_tick: false,
        }
    }

    /// Current phase, after expiring a finished stabilization window.
    pub fn phase(&mut self, now: Instant) -> TuningPhase {
        if let TuningPhase::Stabilizing { until: Some(until) } = self.phase {
            if now >= until {
                debug!("Stabilization window closed");
                self.phase = TuningPhase::Idle;
            }
        }
        self.phase
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        self.last_adjustment_at
            .map(|at| now.saturating_duration_since(at) < cooldown)
            .unwrap_or(false)
    }

    /// Whether an automatic change may start now.
    pub fn can_evaluate(&mut self, now: Instant) -> bool {
        self.config.enabled && self.phase(now) == TuningPhase::Idle && !self.in_cooldown(now)
    }

    fn holds(&self, reason: TuningReason, signals: &TuningSignals) -> bool {
        match reason {
            TuningReason::HighCpu => signals.cpu_percent > self.config.high_cpu_percent,
            TuningReason::HighLatency => signals
                .mean_latency_ms
                .map(|l| l > self.config.high_latency_ms)
                .unwrap_or(false),
            TuningReason::UnreliableDevice => signals
                .min_reliability
                .map(|r| r < self.config.unreliable_reliability)
                .unwrap_or(false),
            TuningReason::LowPerformance => signals
                .score
                .as_ref()
                .map(|s| s.total < self.config.low_score)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Fixed-tick entry point. Conditions must persist for `sustain_ticks`
    /// consecutive ticks before they drive a change.
    pub fn on_tick(
        &mut self,
        now: Instant,
        signals: &TuningSignals,
        target: &dyn TuningTarget,
    ) -> Option<TuningEvent> {
        self.blocked_until_tick = false;

        for reason in TICK_REASONS {
            let holds = self.config.enabled && self.holds(reason, signals);
            let streak = self.streaks.entry(reason).or_insert(0);
            if holds {
                *streak += 1;
            } else {
                *streak = 0;
            }
        }

        if !self.can_evaluate(now) {
            return None;
        }

        let sustain = self.config.sustain_ticks;
        let params = target.current();
        for reason in TICK_REASONS {
            if self.streaks.get(&reason).copied().unwrap_or(0) < sustain {
                continue;
            }
            self.phase = TuningPhase::Evaluating;
            let changes = self.evaluate(reason, signals, &params);
            if changes.is_empty() {
                debug!("No applicable change for {}", reason);
                self.phase = TuningPhase::Idle;
                continue;
            }
            return Some(self.apply(now, reason, changes, target));
        }
        None
    }

    /// Event-driven entry point (high CPU, high latency, unreliable device,
    /// low score observed outside the tick). Skips the sustain requirement
    /// but honors cooldown and stabilization.
    pub fn on_trigger(
        &mut self,
        now: Instant,
        reason: TuningReason,
        signals: &TuningSignals,
        target: &dyn TuningTarget,
    ) -> Option<TuningEvent> {
        if self.blocked_until_tick {
            debug!("Trigger {} ignored until next tick after failed apply", reason);
            return None;
        }
        if !self.can_evaluate(now) {
            debug!("Trigger {} suppressed (phase {:?})", reason, self.phase);
            return None;
        }

        self.phase = TuningPhase::Evaluating;
        let params = target.current();
        let changes = self.evaluate(reason, signals, &params);
        if changes.is_empty() {
            self.phase = TuningPhase::Idle;
            return None;
        }
        Some(self.apply(now, reason, changes, target))
    }

    /// Candidate changes for a reason, clamped to the target's bounds.
    pub fn evaluate(
        &self,
        reason: TuningReason,
        signals: &TuningSignals,
        params: &TunableParams,
    ) -> Vec<ParameterChange> {
        let mut changes = Vec::new();
        match reason {
            TuningReason::HighCpu => {
                let to = params.worker_count.saturating_sub(1).max(params.min_workers);
                if to < params.worker_count {
                    changes.push(ParameterChange::WorkerCount {
                        from: params.worker_count,
                        to,
                    });
                }
            }
            TuningReason::HighLatency => {
                let to_min = params
                    .buffer_min
                    .saturating_sub(self.config.buffer_widen_min_step)
                    .max(params.buffer_floor)
                    .min(params.buffer_min);
                let to_max = params
                    .buffer_max
                    .saturating_add(self.config.buffer_widen_max_step)
                    .min(params.buffer_ceiling)
                    .max(params.buffer_max);
                if to_min != params.buffer_min || to_max != params.buffer_max {
                    changes.push(ParameterChange::BufferRange {
                        from_min: params.buffer_min,
                        from_max: params.buffer_max,
                        to_min,
                        to_max,
                    });
                }

                let to_ms = ((params.health_interval_ms as f64 * self.config.interval_factor)
                    .round() as u64)
                    .min(params.max_health_interval_ms)
                    .max(params.health_interval_ms);
                if to_ms != params.health_interval_ms {
                    changes.push(ParameterChange::HealthInterval {
                        from_ms: params.health_interval_ms,
                        to_ms,
                    });
                }
            }
            TuningReason::UnreliableDevice => {
                for (device, reliability, timeout_ms) in &params.devices {
                    if *reliability >= self.config.unreliable_reliability {
                        continue;
                    }
                    let to_ms = ((*timeout_ms as f64 * self.config.timeout_factor).round()
                        as u64)
                        .min(params.max_probe_timeout_ms)
                        .max(*timeout_ms);
                    if to_ms != *timeout_ms {
                        changes.push(ParameterChange::ProbeTimeout {
                            device: device.clone(),
                            from_ms: *timeout_ms,
                            to_ms,
                        });
                    }
                }
            }
            TuningReason::LowPerformance => {
                if let Some(score) = &signals.score {
                    let mapped = match score.weakest() {
                        SubScore::Cpu | SubScore::Memory => TuningReason::HighCpu,
                        SubScore::Audio | SubScore::Network => TuningReason::HighLatency,
                        SubScore::Device => TuningReason::UnreliableDevice,
                    };
                    changes = self.evaluate(mapped, signals, params);
                }
            }
            _ => {}
        }
        changes
    }

    fn apply(
        &mut self,
        now: Instant,
        reason: TuningReason,
        changes: Vec<ParameterChange>,
        target: &dyn TuningTarget,
    ) -> TuningEvent {
        self.phase = TuningPhase::Applying;

        for (index, change) in changes.iter().enumerate() {
            if let Err(e) = target.apply(change) {
                error!("Tuning for {} failed at '{}': {}", reason, change.describe(), e);
                // Earlier changes of the set are live; they still start a cooldown.
                if index > 0 {
                    self.last_adjustment_at = Some(now);
                }
                self.phase = TuningPhase::Idle;
                self.blocked_until_tick = true;
                return TuningEvent::new(reason, changes, Some(e.to_string()));
            }
        }

        let stabilization = Duration::from_millis(self.config.stabilization_ms());
        self.last_adjustment_at = Some(now);
        self.phase = TuningPhase::Stabilizing {
            until: Some(now + stabilization),
        };
        self.streaks.values_mut().for_each(|s| *s = 0);

        info!(
            "Applied tuning for {}: {}",
            reason,
            changes
                .iter()
                .map(ParameterChange::describe)
                .collect::<Vec<_>>()
                .join(", ")
        );
        TuningEvent::new(reason, changes, None)
    }
}
