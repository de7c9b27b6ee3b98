//! Configuration types for the streamtune engine
//!
//! Every heuristic threshold used by the engine lives here under a name, with
//! the defaults matching observed production behavior. The optimizer mutates a
//! live copy of these values at runtime; the copy loaded at startup is only
//! validated once.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub workers: WorkerPoolConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub tuning: TuningConfig,

    #[serde(default)]
    pub alerts: AlertThresholds,
}

impl EngineConfig {
    /// Reject inconsistent bounds. Called once at startup; the engine never
    /// reports configuration errors at runtime.
    pub fn validate(&self) -> Result<()> {
        self.workers.validate()?;
        self.buffer.validate()?;
        self.health.validate()?;
        self.scoring.validate()?;
        self.tuning.validate()?;
        Ok(())
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Use the worker pool at all; when false every chunk is processed in-process
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Configured maximum number of workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Hard cap applied on top of `max_workers` and the CPU count
    #[serde(default = "default_worker_cap")]
    pub worker_cap: usize,

    /// Lowest worker count the optimizer may reduce to
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Per-task timeout in milliseconds
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Concurrent in-process fallback tasks before backpressure kicks in
    #[serde(default = "default_fallback_concurrency")]
    pub fallback_concurrency: usize,

    /// Linear gain applied by the default PCM processor
    #[serde(default = "default_gain")]
    pub gain: f32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_workers: default_max_workers(),
            worker_cap: default_worker_cap(),
            min_workers: default_min_workers(),
            task_timeout_ms: default_task_timeout_ms(),
            fallback_concurrency: default_fallback_concurrency(),
            gain: default_gain(),
        }
    }
}

impl WorkerPoolConfig {
    /// Pool size derived from configuration and the host's parallelism.
    pub fn effective_max(&self) -> usize {
        self.max_workers
            .min(get_num_cpus())
            .min(self.worker_cap)
            .max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_cap == 0 || self.max_workers == 0 {
            return Err(Error::ConfigError(
                "workers.max_workers and workers.worker_cap must be at least 1".to_string(),
            ));
        }
        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return Err(Error::ConfigError(format!(
                "workers.min_workers ({}) must be within 1..={}",
                self.min_workers, self.max_workers
            )));
        }
        if self.task_timeout_ms == 0 {
            return Err(Error::ConfigError(
                "workers.task_timeout_ms must be positive".to_string(),
            ));
        }
        if !self.gain.is_finite() || self.gain < 0.0 {
            return Err(Error::ConfigError(format!(
                "workers.gain must be a non-negative number, got {}",
                self.gain
            )));
        }
        Ok(())
    }
}

/// Adaptive buffer configuration. Sizes are milliseconds of audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_initial_size")]
    pub initial_size: u32,

    #[serde(default = "default_min_size")]
    pub min_size: u32,

    #[serde(default = "default_max_size")]
    pub max_size: u32,

    /// Lowest value the optimizer may move `min_size` to
    #[serde(default = "default_floor_size")]
    pub floor_size: u32,

    /// Highest value the optimizer may move `max_size` to
    #[serde(default = "default_ceiling_size")]
    pub ceiling_size: u32,

    /// Minimum time between two adjustments of the same device
    #[serde(default = "default_buffer_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_underrun_threshold")]
    pub underrun_threshold: usize,

    #[serde(default = "default_underrun_window_ms")]
    pub underrun_window_ms: u64,

    #[serde(default = "default_underrun_step")]
    pub underrun_step: u32,

    #[serde(default = "default_overrun_threshold")]
    pub overrun_threshold: usize,

    #[serde(default = "default_overrun_window_ms")]
    pub overrun_window_ms: u64,

    #[serde(default = "default_overrun_step")]
    pub overrun_step: u32,

    #[serde(default = "default_dropout_step")]
    pub dropout_step: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_size: default_initial_size(),
            min_size: default_min_size(),
            max_size: default_max_size(),
            floor_size: default_floor_size(),
            ceiling_size: default_ceiling_size(),
            cooldown_ms: default_buffer_cooldown_ms(),
            underrun_threshold: default_underrun_threshold(),
            underrun_window_ms: default_underrun_window_ms(),
            underrun_step: default_underrun_step(),
            overrun_threshold: default_overrun_threshold(),
            overrun_window_ms: default_overrun_window_ms(),
            overrun_step: default_overrun_step(),
            dropout_step: default_dropout_step(),
        }
    }
}

impl BufferConfig {
    fn validate(&self) -> Result<()> {
        if self.min_size > self.max_size {
            return Err(Error::ConfigError(format!(
                "buffer.min_size ({}) is greater than buffer.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.floor_size > self.min_size || self.ceiling_size < self.max_size {
            return Err(Error::ConfigError(format!(
                "buffer range {}..={} must lie within floor/ceiling {}..={}",
                self.min_size, self.max_size, self.floor_size, self.ceiling_size
            )));
        }
        if self.underrun_threshold == 0 || self.overrun_threshold == 0 {
            return Err(Error::ConfigError(
                "buffer underrun/overrun thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Device health tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Starting probe interval, also the uptime accounting period
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,

    #[serde(default = "default_min_ping_interval_ms")]
    pub min_ping_interval_ms: u64,

    #[serde(default = "default_max_ping_interval_ms")]
    pub max_ping_interval_ms: u64,

    /// Probes faster than this lengthen the interval
    #[serde(default = "default_fast_latency_ms")]
    pub fast_latency_ms: u64,

    /// Probes slower than this shorten the interval
    #[serde(default = "default_slow_latency_ms")]
    pub slow_latency_ms: u64,

    #[serde(default = "default_grow_factor")]
    pub grow_factor: f64,

    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Upper bound for per-device timeouts extended by the optimizer
    #[serde(default = "default_max_probe_timeout_ms")]
    pub max_probe_timeout_ms: u64,

    /// Recovery starts once consecutive failures exceed this value
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Contact older than this counts as stale for uptime accounting
    #[serde(default = "default_contact_stale_ms")]
    pub contact_stale_ms: u64,

    #[serde(default = "default_reliability_gain")]
    pub reliability_gain: f64,

    #[serde(default = "default_reliability_penalty")]
    pub reliability_penalty: f64,

    #[serde(default = "default_uptime_decay")]
    pub uptime_decay: f64,

    #[serde(default = "default_uptime_recovery")]
    pub uptime_recovery: f64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Delay between the first probes of successive devices
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            min_ping_interval_ms: default_min_ping_interval_ms(),
            max_ping_interval_ms: default_max_ping_interval_ms(),
            fast_latency_ms: default_fast_latency_ms(),
            slow_latency_ms: default_slow_latency_ms(),
            grow_factor: default_grow_factor(),
            shrink_factor: default_shrink_factor(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_probe_timeout_ms: default_max_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            settle_ms: default_settle_ms(),
            contact_stale_ms: default_contact_stale_ms(),
            reliability_gain: default_reliability_gain(),
            reliability_penalty: default_reliability_penalty(),
            uptime_decay: default_uptime_decay(),
            uptime_recovery: default_uptime_recovery(),
            history_capacity: default_history_capacity(),
            stagger_ms: default_stagger_ms(),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<()> {
        if self.min_ping_interval_ms > self.max_ping_interval_ms {
            return Err(Error::ConfigError(format!(
                "health.min_ping_interval_ms ({}) is greater than health.max_ping_interval_ms ({})",
                self.min_ping_interval_ms, self.max_ping_interval_ms
            )));
        }
        if self.base_interval_ms == 0 || self.min_ping_interval_ms == 0 {
            return Err(Error::ConfigError(
                "health intervals must be positive".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 || self.probe_timeout_ms > self.max_probe_timeout_ms {
            return Err(Error::ConfigError(format!(
                "health.probe_timeout_ms ({}) must be within 1..={}",
                self.probe_timeout_ms, self.max_probe_timeout_ms
            )));
        }
        if self.fast_latency_ms > self.slow_latency_ms {
            return Err(Error::ConfigError(
                "health.fast_latency_ms must not exceed health.slow_latency_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sub-score weights for the performance score
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub memory: f64,
    pub audio: f64,
    pub network: f64,
    pub device: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: 0.25,
            memory: 0.15,
            audio: 0.30,
            network: 0.20,
            device: 0.10,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.cpu + self.memory + self.audio + self.network + self.device
    }
}

/// Performance scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default)]
    pub weights: ScoreWeights,

    #[serde(default = "default_excellent_latency_ms")]
    pub excellent_latency_ms: f64,

    #[serde(default = "default_good_latency_ms")]
    pub good_latency_ms: f64,

    #[serde(default = "default_fair_latency_ms")]
    pub fair_latency_ms: f64,

    #[serde(default = "default_score_history_capacity")]
    pub history_capacity: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            weights: ScoreWeights::default(),
            excellent_latency_ms: default_excellent_latency_ms(),
            good_latency_ms: default_good_latency_ms(),
            fair_latency_ms: default_fair_latency_ms(),
            history_capacity: default_score_history_capacity(),
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(Error::ConfigError(
                "scoring.tick_ms must be positive".to_string(),
            ));
        }
        if (self.weights.sum() - 1.0).abs() > 1e-6 {
            return Err(Error::ConfigError(format!(
                "scoring weights must sum to 1.0, got {:.3}",
                self.weights.sum()
            )));
        }
        if !(self.excellent_latency_ms <= self.good_latency_ms
            && self.good_latency_ms <= self.fair_latency_ms)
        {
            return Err(Error::ConfigError(
                "scoring latency buckets must be ascending".to_string(),
            ));
        }
        Ok(())
    }
}

/// Auto-tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Minimum time between two automatic changes; stabilization lasts twice this
    #[serde(default = "default_tuning_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Consecutive ticks a condition must hold before it drives tuning
    #[serde(default = "default_sustain_ticks")]
    pub sustain_ticks: u32,

    #[serde(default = "default_high_cpu_percent")]
    pub high_cpu_percent: f64,

    #[serde(default = "default_high_latency_ms")]
    pub high_latency_ms: f64,

    #[serde(default = "default_unreliable_reliability")]
    pub unreliable_reliability: f64,

    #[serde(default = "default_low_score")]
    pub low_score: f64,

    #[serde(default = "default_buffer_widen_min_step")]
    pub buffer_widen_min_step: u32,

    #[serde(default = "default_buffer_widen_max_step")]
    pub buffer_widen_max_step: u32,

    #[serde(default = "default_interval_factor")]
    pub interval_factor: f64,

    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,

    #[serde(default = "default_tuning_history_capacity")]
    pub history_capacity: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            tick_ms: default_tick_ms(),
            cooldown_ms: default_tuning_cooldown_ms(),
            sustain_ticks: default_sustain_ticks(),
            high_cpu_percent: default_high_cpu_percent(),
            high_latency_ms: default_high_latency_ms(),
            unreliable_reliability: default_unreliable_reliability(),
            low_score: default_low_score(),
            buffer_widen_min_step: default_buffer_widen_min_step(),
            buffer_widen_max_step: default_buffer_widen_max_step(),
            interval_factor: default_interval_factor(),
            timeout_factor: default_timeout_factor(),
            history_capacity: default_tuning_history_capacity(),
        }
    }
}

impl TuningConfig {
    /// Length of the stabilization window that follows an applied change.
    pub fn stabilization_ms(&self) -> u64 {
        self.cooldown_ms.saturating_mul(2)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(Error::ConfigError(
                "tuning.tick_ms must be positive".to_string(),
            ));
        }
        if self.sustain_ticks == 0 {
            return Err(Error::ConfigError(
                "tuning.sustain_ticks must be at least 1".to_string(),
            ));
        }
        if self.interval_factor < 1.0 || self.timeout_factor < 1.0 {
            return Err(Error::ConfigError(
                "tuning interval/timeout factors must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Thresholds for resource alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_cpu_warning")]
    pub cpu_warning: f64,

    #[serde(default = "default_cpu_critical")]
    pub cpu_critical: f64,

    #[serde(default = "default_memory_warning")]
    pub memory_warning: f64,

    #[serde(default = "default_memory_critical")]
    pub memory_critical: f64,

    #[serde(default = "default_latency_warning_ms")]
    pub latency_warning_ms: f64,

    #[serde(default = "default_alert_history_capacity")]
    pub history_capacity: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: default_cpu_warning(),
            cpu_critical: default_cpu_critical(),
            memory_warning: default_memory_warning(),
            memory_critical: default_memory_critical(),
            latency_warning_ms: default_latency_warning_ms(),
            history_capacity: default_alert_history_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    4
}

fn default_worker_cap() -> usize {
    4
}

fn default_min_workers() -> usize {
    1
}

fn default_task_timeout_ms() -> u64 {
    1000
}

fn default_fallback_concurrency() -> usize {
    2
}

fn default_gain() -> f32 {
    1.0
}

fn default_initial_size() -> u32 {
    250
}

fn default_min_size() -> u32 {
    100
}

fn default_max_size() -> u32 {
    500
}

fn default_floor_size() -> u32 {
    50
}

fn default_ceiling_size() -> u32 {
    1000
}

fn default_buffer_cooldown_ms() -> u64 {
    5000
}

fn default_underrun_threshold() -> usize {
    3
}

fn default_underrun_window_ms() -> u64 {
    60_000
}

fn default_underrun_step() -> u32 {
    50
}

fn default_overrun_threshold() -> usize {
    10
}

fn default_overrun_window_ms() -> u64 {
    120_000
}

fn default_overrun_step() -> u32 {
    25
}

fn default_dropout_step() -> u32 {
    100
}

fn default_base_interval_ms() -> u64 {
    30_000
}

fn default_min_ping_interval_ms() -> u64 {
    10_000
}

fn default_max_ping_interval_ms() -> u64 {
    120_000
}

fn default_fast_latency_ms() -> u64 {
    100
}

fn default_slow_latency_ms() -> u64 {
    500
}

fn default_grow_factor() -> f64 {
    1.2
}

fn default_shrink_factor() -> f64 {
    0.8
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_max_probe_timeout_ms() -> u64 {
    15_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_contact_stale_ms() -> u64 {
    60_000
}

fn default_reliability_gain() -> f64 {
    2.0
}

fn default_reliability_penalty() -> f64 {
    10.0
}

fn default_uptime_decay() -> f64 {
    1.0
}

fn default_uptime_recovery() -> f64 {
    0.1
}

fn default_history_capacity() -> usize {
    50
}

fn default_stagger_ms() -> u64 {
    500
}

fn default_tick_ms() -> u64 {
    60_000
}

fn default_excellent_latency_ms() -> f64 {
    50.0
}

fn default_good_latency_ms() -> f64 {
    100.0
}

fn default_fair_latency_ms() -> f64 {
    250.0
}

fn default_score_history_capacity() -> usize {
    60
}

fn default_tuning_cooldown_ms() -> u64 {
    30_000
}

fn default_sustain_ticks() -> u32 {
    3
}

fn default_high_cpu_percent() -> f64 {
    80.0
}

fn default_high_latency_ms() -> f64 {
    250.0
}

fn default_unreliable_reliability() -> f64 {
    70.0
}

fn default_low_score() -> f64 {
    60.0
}

fn default_buffer_widen_min_step() -> u32 {
    25
}

fn default_buffer_widen_max_step() -> u32 {
    100
}

fn default_interval_factor() -> f64 {
    1.5
}

fn default_timeout_factor() -> f64 {
    1.5
}

fn default_tuning_history_capacity() -> usize {
    100
}

fn default_cpu_warning() -> f64 {
    80.0
}

fn default_cpu_critical() -> f64 {
    95.0
}

fn default_memory_warning() -> f64 {
    85.0
}

fn default_memory_critical() -> f64 {
    95.0
}

fn default_latency_warning_ms() -> f64 {
    500.0
}

fn default_alert_history_capacity() -> usize {
    100
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_cors_enabled() -> bool {
    true
}

fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer.cooldown_ms, 5000);
        assert_eq!(config.tuning.stabilization_ms(), 60_000);
    }

    #[test]
    fn test_min_greater_than_max_rejected() {
        let mut config = EngineConfig::default();
        config.buffer.min_size = 600;
        config.buffer.max_size = 500;
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_equal_bounds_accepted() {
        let mut config = EngineConfig::default();
        config.buffer.min_size = 300;
        config.buffer.max_size = 300;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = EngineConfig::default();
        config.scoring.weights.cpu = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_max_is_capped() {
        let config = WorkerPoolConfig {
            max_workers: 16,
            worker_cap: 4,
            ..Default::default()
        };
        assert!(config.effective_max() <= 4);
        assert!(config.effective_max() >= 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [buffer]
            max_size = 800

            [tuning]
            cooldown_ms = 10000
            "#,
        )
        .unwrap();
        assert_eq!(config.buffer.max_size, 800);
        assert_eq!(config.buffer.min_size, 100);
        assert_eq!(config.tuning.stabilization_ms(), 20_000);
        assert_eq!(config.health.settle_ms, 2000);
    }
}
