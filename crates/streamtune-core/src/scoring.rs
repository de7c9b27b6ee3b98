//! Weighted 0-100 performance score.
//!
//! The score is a pure function of a `ScoreInputs` snapshot. System load is
//! read through the `SystemSampler` trait so the control loop can be driven
//! by fixed metrics under test.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::audio::AudioCounters;
use crate::config::ScoringConfig;

/// Host resource usage, both in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of host resource usage.
pub trait SystemSampler: Send + Sync + 'static {
    fn sample(&self) -> SystemMetrics;
}

/// Samples the local host with `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for SysinfoSampler {
    fn sample(&self) -> SystemMetrics {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage() as f64;
        let total = system.total_memory();
        let memory_percent = if total > 0 {
            system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        SystemMetrics {
            cpu_percent,
            memory_percent,
        }
    }
}

/// Qualitative network bucket derived from mean device latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn deduction(&self) -> f64 {
        match self {
            NetworkQuality::Excellent => 0.0,
            NetworkQuality::Good => 10.0,
            NetworkQuality::Fair => 30.0,
            NetworkQuality::Poor => 60.0,
        }
    }
}

/// Everything the score is computed from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreInputs {
    pub system: SystemMetrics,
    pub audio: AudioCounters,
    pub mean_latency_ms: Option<f64>,
    pub mean_reliability: Option<f64>,
}

/// Latest score with its clamped sub-scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceScore {
    pub total: f64,
    pub cpu: f64,
    pub memory: f64,
    pub audio: f64,
    pub network: f64,
    pub device: f64,
    pub network_quality: NetworkQuality,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Sub-score identifiers, used to find what drags the total down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubScore {
    Cpu,
    Memory,
    Audio,
    Network,
    Device,
}

impl PerformanceScore {
    /// The lowest sub-score; ties resolve in declaration order.
    pub fn weakest(&self) -> SubScore {
        [
            (SubScore::Cpu, self.cpu),
            (SubScore::Memory, self.memory),
            (SubScore::Audio, self.audio),
            (SubScore::Network, self.network),
            (SubScore::Device, self.device),
        ]
        .into_iter()
        .fold((SubScore::Cpu, f64::INFINITY), |best, (which, value)| {
            if value < best.1 {
                (which, value)
            } else {
                best
            }
        })
        .0
    }
}

fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// CPU sub-score: 100 up to 40 %, 85 up to 60 %, 70 up to 80 %, then
/// `100 - (cpu - 80) * 2`, floored at 0.
pub fn cpu_score(cpu_percent: f64) -> f64 {
    let score = if cpu_percent <= 40.0 {
        100.0
    } else if cpu_percent <= 60.0 {
        85.0
    } else if cpu_percent <= 80.0 {
        70.0
    } else {
        100.0 - (cpu_percent - 80.0) * 2.0
    };
    clamp_score(score)
}

/// Memory sub-score: 100 up to 50 %, 85 up to 70 %, 70 up to 85 %, then a
/// linear decay reaching 0 at 100 %.
pub fn memory_score(memory_percent: f64) -> f64 {
    let score = if memory_percent <= 50.0 {
        100.0
    } else if memory_percent <= 70.0 {
        85.0
    } else if memory_percent <= 85.0 {
        70.0
    } else {
        70.0 - (memory_percent - 85.0) * (70.0 / 15.0)
    };
    clamp_score(score)
}

/// Audio sub-score: 100 minus 10 per dropout, 2 per underrun, 1 per overrun.
pub fn audio_score(counters: &AudioCounters) -> f64 {
    clamp_score(
        100.0
            - counters.dropouts as f64 * 10.0
            - counters.underruns as f64 * 2.0
            - counters.overruns as f64,
    )
}

/// Computes scores and keeps a bounded trend.
pub struct PerformanceScorer {
    config: ScoringConfig,
    history: VecDeque<PerformanceScore>,
}

impl PerformanceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            config,
        }
    }

    pub fn network_quality(&self, mean_latency_ms: Option<f64>) -> NetworkQuality {
        match mean_latency_ms {
            None => NetworkQuality::Excellent,
            Some(l) if l < self.config.excellent_latency_ms => NetworkQuality::Excellent,
            Some(l) if l < self.config.good_latency_ms => NetworkQuality::Good,
            Some(l) if l < self.config.fair_latency_ms => NetworkQuality::Fair,
            Some(_) => NetworkQuality::Poor,
        }
    }

    /// Pure scoring of one snapshot.
    pub fn score(&self, inputs: &ScoreInputs) -> PerformanceScore {
        let weights = &self.config.weights;
        let quality = self.network_quality(inputs.mean_latency_ms);

        let cpu = cpu_score(inputs.system.cpu_percent);
        let memory = memory_score(inputs.system.memory_percent);
        let audio = audio_score(&inputs.audio);
        let network = clamp_score(100.0 - quality.deduction());
        let device = clamp_score(inputs.mean_reliability.unwrap_or(100.0));

        let total = clamp_score(
            cpu * weights.cpu
                + memory * weights.memory
                + audio * weights.audio
                + network * weights.network
                + device * weights.device,
        );

        PerformanceScore {
            total,
            cpu,
            memory,
            audio,
            network,
            device,
            network_quality: quality,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Score and append to the trend history.
    pub fn record(&mut self, inputs: &ScoreInputs) -> PerformanceScore {
        let score = self.score(inputs);
        if self.config.history_capacity > 0 {
            while self.history.len() >= self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(score.clone());
        }
        score
    }

    pub fn latest(&self) -> Option<&PerformanceScore> {
        self.history.back()
    }

    pub fn history(&self) -> Vec<PerformanceScore> {
        self.history.iter().cloned().collect()
    }

    /// Change in total score across the recorded history.
    pub fn trend(&self) -> f64 {
        match (self.history.front(), self.history.back()) {
            (Some(first), Some(last)) => last.total - first.total,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_breakpoints() {
        assert_eq!(cpu_score(10.0), 100.0);
        assert_eq!(cpu_score(40.0), 100.0);
        assert_eq!(cpu_score(55.0), 85.0);
        assert_eq!(cpu_score(80.0), 70.0);
        assert_eq!(cpu_score(85.0), 90.0);
        assert_eq!(cpu_score(90.0), 80.0);
        assert_eq!(cpu_score(100.0), 60.0);
        assert_eq!(cpu_score(120.0), 20.0);
        assert_eq!(cpu_score(150.0), 0.0);
        assert_eq!(cpu_score(400.0), 0.0);
    }

    #[test]
    fn test_audio_debits() {
        let counters = AudioCounters {
            underruns: 3,
            overruns: 4,
            dropouts: 2,
        };
        assert_eq!(audio_score(&counters), 70.0);
        let terrible = AudioCounters {
            dropouts: 50,
            ..Default::default()
        };
        assert_eq!(audio_score(&terrible), 0.0);
    }

    #[test]
    fn test_idle_system_scores_full() {
        let scorer = PerformanceScorer::new(ScoringConfig::default());
        let score = scorer.score(&ScoreInputs::default());
        assert!((score.total - 100.0).abs() < 1e-9);
        assert_eq!(score.network_quality, NetworkQuality::Excellent);
    }

    #[test]
    fn test_network_buckets() {
        let scorer = PerformanceScorer::new(ScoringConfig::default());
        assert_eq!(scorer.network_quality(Some(20.0)), NetworkQuality::Excellent);
        assert_eq!(scorer.network_quality(Some(75.0)), NetworkQuality::Good);
        assert_eq!(scorer.network_quality(Some(200.0)), NetworkQuality::Fair);
        assert_eq!(scorer.network_quality(Some(900.0)), NetworkQuality::Poor);
    }

    #[test]
    fn test_weighted_total() {
        let scorer = PerformanceScorer::new(ScoringConfig::default());
        let score = scorer.score(&ScoreInputs {
            system: SystemMetrics {
                cpu_percent: 90.0,
                memory_percent: 30.0,
            },
            audio: AudioCounters {
                dropouts: 1,
                ..Default::default()
            },
            mean_latency_ms: Some(300.0),
            mean_reliability: Some(50.0),
        });
        // 80*.25 + 100*.15 + 90*.30 + 40*.20 + 50*.10
        assert!((score.total - 75.0).abs() < 1e-9);
        assert_eq!(score.weakest(), SubScore::Network);
    }

    #[test]
    fn test_scores_always_clamped() {
        let scorer = PerformanceScorer::new(ScoringConfig::default());
        for cpu in [-20.0, 0.0, 50.0, 99.9, 400.0, f64::NAN] {
            let score = scorer.score(&ScoreInputs {
                system: SystemMetrics {
                    cpu_percent: cpu,
                    memory_percent: cpu,
                },
                mean_reliability: Some(cpu),
                ..Default::default()
            });
            for value in [
                score.total,
                score.cpu,
                score.memory,
                score.audio,
                score.network,
                score.device,
            ] {
                assert!((0.0..=100.0).contains(&value), "{} out of range", value);
            }
        }
    }

    #[test]
    fn test_history_bounded_with_trend() {
        let mut scorer = PerformanceScorer::new(ScoringConfig {
            history_capacity: 3,
            ..Default::default()
        });
        scorer.record(&ScoreInputs::default());
        for _ in 0..4 {
            scorer.record(&ScoreInputs {
                audio: AudioCounters {
                    dropouts: 10,
                    ..Default::default()
                },
                ..Default::default()
            });
        }
        assert_eq!(scorer.history().len(), 3);
        assert_eq!(scorer.trend(), 0.0);
        assert!(scorer.latest().unwrap().total < 100.0);
    }
}
