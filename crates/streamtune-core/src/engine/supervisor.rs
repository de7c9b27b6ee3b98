//! Engine supervisor: owns every component and runs the periodic loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::optimizer::{
    AutoTuningOptimizer, ParameterChange, TunableParams, TuningEvent, TuningLog, TuningPhase,
    TuningSignals, TuningTarget,
};
use super::pipeline::{AudioProcessingPipeline, PipelineStats};
use super::types::{DeviceId, DropReason, ProcessOutcome, Readiness, TuningReason};
use super::worker_pool::{PoolStats, WorkerPool};
use crate::alerts::{Alert, AlertLevel, AlertPublisher, EngineEvent};
use crate::audio::{
    AdaptiveBufferController, BufferAdjustment, BufferState, ChunkProcessor, PcmGainProcessor,
};
use crate::collaborators::{AudioSource, DeviceController, StreamMetadata, StreamRelay};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::health::{DeviceEventKind, DeviceHealthTracker, DeviceSnapshot, ProbeVerdict};
use crate::scoring::{
    PerformanceScore, PerformanceScorer, ScoreInputs, SysinfoSampler, SystemMetrics, SystemSampler,
};

const READY_POLL: Duration = Duration::from_millis(10);

/// External parts the engine talks to.
pub struct Collaborators {
    pub controller: Arc<dyn DeviceController>,
    pub relay: Arc<dyn StreamRelay>,
    pub sampler: Arc<dyn SystemSampler>,
    /// Defaults to a `PcmGainProcessor` with the configured gain
    pub processor: Option<Arc<dyn ChunkProcessor>>,
}

impl Collaborators {
    pub fn new(controller: Arc<dyn DeviceController>, relay: Arc<dyn StreamRelay>) -> Self {
        Self {
            controller,
            relay,
            sampler: Arc::new(SysinfoSampler::new()),
            processor: None,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn SystemSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn ChunkProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }
}

/// Everything a reader may want to know, in one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub workers: Option<PoolStats>,
    pub devices: Vec<DeviceSnapshot>,
    pub buffer_states: HashMap<DeviceId, BufferState>,
    pub score: Option<PerformanceScore>,
    pub score_history: Vec<PerformanceScore>,
    /// Change in total score across `score_history`
    pub score_trend: f64,
    pub tuning_history: Vec<TuningEvent>,
    pub tuning_phase: TuningPhase,
    pub pipeline: PipelineStats,
    pub recent_alerts: Vec<Alert>,
    pub uptime_secs: u64,
}

struct EngineInner {
    config: EngineConfig,
    pool: Option<Arc<WorkerPool>>,
    pipeline: AudioProcessingPipeline,
    buffers: Mutex<AdaptiveBufferController>,
    health: Mutex<DeviceHealthTracker>,
    scorer: Mutex<PerformanceScorer>,
    optimizer: Mutex<AutoTuningOptimizer>,
    tuning_log: Mutex<TuningLog>,
    alerts: AlertPublisher,
    controller: Arc<dyn DeviceController>,
    relay: Arc<dyn StreamRelay>,
    sampler: Arc<dyn SystemSampler>,
    /// Devices with an open stream and what they were asked to play
    streams: Mutex<HashMap<DeviceId, StreamMetadata>>,
    probe_loops: Mutex<HashMap<DeviceId, CancellationToken>>,
    registrations: AtomicUsize,
    network_errors: AtomicU64,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Adaptive streaming engine. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl Engine {
    /// Validate configuration, build every component and start the control
    /// loop. Must be called from within a Tokio runtime.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let processor = collaborators
            .processor
            .unwrap_or_else(|| Arc::new(PcmGainProcessor::new(config.workers.gain)));
        let pool = if config.workers.enabled {
            Some(Arc::new(WorkerPool::new(&config.workers, processor.clone())?))
        } else {
            info!("Worker pool disabled, processing in-process");
            None
        };
        let pipeline = AudioProcessingPipeline::new(&config.workers, pool.clone(), processor);

        let inner = Arc::new(EngineInner {
            pool,
            pipeline,
            buffers: Mutex::new(AdaptiveBufferController::new(config.buffer.clone())),
            health: Mutex::new(DeviceHealthTracker::new(config.health.clone())),
            scorer: Mutex::new(PerformanceScorer::new(config.scoring.clone())),
            optimizer: Mutex::new(AutoTuningOptimizer::new(config.tuning.clone())),
            tuning_log: Mutex::new(TuningLog::new(config.tuning.history_capacity)),
            alerts: AlertPublisher::new(config.alerts.history_capacity),
            controller: collaborators.controller,
            relay: collaborators.relay,
            sampler: collaborators.sampler,
            streams: Mutex::new(HashMap::new()),
            probe_loops: Mutex::new(HashMap::new()),
            registrations: AtomicUsize::new(0),
            network_errors: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
            config,
        });

        tokio::spawn(EngineInner::control_loop(inner.clone()));
        info!("Streaming engine started");

        Ok(Self { inner })
    }

    /// Start tracking and probing a device. Returns false if it is already
    /// known or the engine is shutting down.
    pub fn register_device(&self, device: DeviceId, host: &str, port: u16) -> bool {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return false;
        }
        if !inner.health.lock().register(&device, host, port, Instant::now()) {
            return false;
        }
        inner.device_event(&device, &DeviceEventKind::Registered);

        let index = inner.registrations.fetch_add(1, Ordering::Relaxed) as u64;
        let delay = Duration::from_millis(inner.config.health.stagger_ms.saturating_mul(index));
        EngineInner::spawn_probe_loop(inner, device, delay);
        true
    }

    /// Stop probing a device and forget it, closing its stream.
    pub fn remove_device(&self, device: &DeviceId) -> bool {
        let inner = &self.inner;
        if let Some(token) = inner.probe_loops.lock().remove(device) {
            token.cancel();
        }
        inner.buffers.lock().close(device);
        inner.streams.lock().remove(device);
        let removed = inner.health.lock().remove(device);
        if removed {
            info!("Removed device {}", device);
            inner.alerts.publish(EngineEvent::DeviceEvent {
                device_id: device.clone(),
                event: "removed".to_string(),
                reliability: None,
            });
        }
        removed
    }

    /// Open the streaming tunnel to a device: create its buffer state and,
    /// when the relay exposes an endpoint, tell the device to play it.
    /// Returns the initial buffer size.
    pub async fn open_stream(&self, device: &DeviceId, metadata: StreamMetadata) -> Result<u32> {
        let inner = &self.inner;
        if !inner.health.lock().contains(device) {
            return Err(Error::DeviceNotFound(device.to_string()));
        }

        let size = inner.buffers.lock().open(device);
        inner.streams.lock().insert(device.clone(), metadata.clone());

        if let Some(endpoint) = inner.relay.endpoint_url(device) {
            if let Err(e) = inner.controller.play(device, &endpoint, &metadata).await {
                inner.buffers.lock().close(device);
                inner.streams.lock().remove(device);
                return Err(e);
            }
        }

        inner.health.lock().note(device, DeviceEventKind::StreamOpened);
        inner.device_event(device, &DeviceEventKind::StreamOpened);
        Ok(size)
    }

    /// Tear down a device's stream. Stop failures are logged only.
    pub async fn close_stream(&self, device: &DeviceId) -> bool {
        let inner = &self.inner;
        let was_open = inner.streams.lock().remove(device).is_some();
        inner.buffers.lock().close(device);
        if !was_open {
            return false;
        }
        if let Err(e) = inner.controller.stop(device).await {
            warn!("Failed to stop {}: {}", device, e);
        }
        inner.health.lock().note(device, DeviceEventKind::StreamClosed);
        inner.device_event(device, &DeviceEventKind::StreamClosed);
        true
    }

    /// Process one chunk for a device with its current buffer size.
    pub async fn process(&self, device: &DeviceId, chunk: Bytes) -> ProcessOutcome {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return ProcessOutcome::Dropped(DropReason::ShuttingDown);
        }
        let buffer_size = inner.buffers.lock().current_size(device);
        let Some(buffer_size) = buffer_size else {
            debug!("Dropping chunk for {} without an open stream", device);
            return ProcessOutcome::Dropped(DropReason::StreamClosed);
        };
        inner.pipeline.process(device, chunk, buffer_size).await
    }

    pub fn report_underrun(&self, device: &DeviceId) -> Option<BufferAdjustment> {
        let adjustment = self.inner.buffers.lock().on_underrun(device, Instant::now());
        adjustment.map(|a| self.inner.record_buffer_adjustment(a))
    }

    pub fn report_overrun(&self, device: &DeviceId) -> Option<BufferAdjustment> {
        let adjustment = self.inner.buffers.lock().on_overrun(device, Instant::now());
        adjustment.map(|a| self.inner.record_buffer_adjustment(a))
    }

    pub fn report_dropout(&self, device: &DeviceId) -> Option<BufferAdjustment> {
        let adjustment = self.inner.buffers.lock().on_dropout(device, Instant::now());
        adjustment.map(|a| self.inner.record_buffer_adjustment(a))
    }

    /// Set a device's volume in percent (clamped to 100).
    pub async fn set_volume(&self, device: &DeviceId, volume: u8) -> Result<()> {
        let inner = &self.inner;
        if !inner.health.lock().contains(device) {
            return Err(Error::DeviceNotFound(device.to_string()));
        }
        let volume = volume.min(100);
        inner.controller.set_volume(device, volume).await?;

        let event = DeviceEventKind::VolumeChanged { volume };
        inner.device_event(device, &event);
        inner.health.lock().note(device, event);
        Ok(())
    }

    /// Manual worker count override. Always permitted, recorded as a
    /// `manual` tuning event, and leaves the optimizer's windows alone.
    pub fn set_worker_count(&self, count: usize) -> Result<usize> {
        let inner = &self.inner;
        let pool = inner
            .pool
            .as_ref()
            .ok_or_else(|| Error::TuningError("worker pool is disabled".to_string()))?;

        let from = pool.stats().target_size;
        let to = pool.resize(count);
        info!("Manual worker count override {} -> {}", from, to);
        inner.record_tuning(TuningEvent::new(
            TuningReason::Manual,
            vec![ParameterChange::WorkerCount { from, to }],
            None,
        ));
        Ok(to)
    }

    /// Ask the optimizer to act on a condition now. Honors cooldown and
    /// stabilization; returns the resulting event if a change was attempted.
    pub fn trigger_tuning(&self, reason: TuningReason) -> Option<TuningEvent> {
        self.inner.trigger(reason)
    }

    /// Drive an audio source until it is exhausted or the engine shuts down.
    ///
    /// Processed chunks go to `sink`. When neither path can take a chunk the
    /// source is told `NotReady`, the chunk is held, and `Ready` follows once
    /// capacity frees up. Returns the number of chunks delivered.
    pub async fn pump<F>(&self, source: &dyn AudioSource, mut sink: F) -> u64
    where
        F: FnMut(&DeviceId, Bytes) + Send,
    {
        let token = self.inner.cancel.clone();
        let mut delivered = 0;

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => None,
                next = source.next_chunk() => next,
            };
            let Some((device, chunk)) = next else {
                break;
            };

            loop {
                match self.process(&device, chunk.clone()).await {
                    ProcessOutcome::Processed(out) => {
                        sink(&device, out);
                        delivered += 1;
                        break;
                    }
                    ProcessOutcome::Dropped(reason) => {
                        debug!("Chunk for {} dropped: {:?}", device, reason);
                        break;
                    }
                    ProcessOutcome::NotReady => {
                        source.set_readiness(&device, Readiness::NotReady);
                        if !self.wait_until_ready(&token).await {
                            return delivered;
                        }
                        source.set_readiness(&device, Readiness::Ready);
                    }
                }
            }
        }
        delivered
    }

    async fn wait_until_ready(&self, token: &CancellationToken) -> bool {
        while !self.inner.pipeline.is_ready() {
            if !sleep_or_cancel(token, READY_POLL).await {
                return false;
            }
        }
        true
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let (score, score_history, score_trend) = {
            let scorer = inner.scorer.lock();
            (scorer.latest().cloned(), scorer.history(), scorer.trend())
        };
        EngineStats {
            workers: inner.pool.as_ref().map(|p| p.stats()),
            devices: inner.health.lock().snapshots(),
            buffer_states: inner.buffers.lock().states(),
            score,
            score_history,
            score_trend,
            tuning_history: inner.tuning_log.lock().events(),
            tuning_phase: inner.optimizer.lock().phase(Instant::now()),
            pipeline: inner.pipeline.stats(),
            recent_alerts: inner.alerts.recent_alerts(),
            uptime_secs: inner.started_at.elapsed().as_secs(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.alerts.subscribe()
    }

    /// Cancel every loop and pending recovery and stop the worker pool.
    pub fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        info!("Shutting down streaming engine");
        self.inner.cancel.cancel();
        if let Some(pool) = &self.inner.pool {
            pool.shutdown();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl EngineInner {
    async fn control_loop(self: Arc<Self>) {
        let start = Instant::now();
        let score_period = Duration::from_millis(self.config.scoring.tick_ms);
        let tuning_period = Duration::from_millis(self.config.tuning.tick_ms);
        let uptime_period = Duration::from_millis(self.config.health.base_interval_ms);

        let mut score_tick = interval_at(start + score_period, score_period);
        let mut tuning_tick = interval_at(start + tuning_period, tuning_period);
        let mut uptime_tick = interval_at(start + uptime_period, uptime_period);
        for tick in [&mut score_tick, &mut tuning_tick, &mut uptime_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = score_tick.tick() => self.on_score_tick(),
                _ = tuning_tick.tick() => self.on_tuning_tick(),
                _ = uptime_tick.tick() => self.health.lock().tick_uptime(Instant::now()),
            }
        }
        debug!("Control loop stopped");
    }

    fn on_score_tick(&self) {
        let metrics = self.sampler.sample();
        let audio = self.buffers.lock().take_audio_counters();
        let (mean_latency_ms, mean_reliability) = {
            let health = self.health.lock();
            (health.mean_latency(), health.mean_reliability())
        };

        let score = self.scorer.lock().record(&ScoreInputs {
            system: metrics,
            audio,
            mean_latency_ms,
            mean_reliability,
        });
        debug!(
            "Performance score {:.1} (cpu {:.0}, memory {:.0}, audio {:.0}, network {:.0}, device {:.0})",
            score.total, score.cpu, score.memory, score.audio, score.network, score.device
        );

        self.alerts.publish(EngineEvent::HealthUpdate {
            cpu: metrics.cpu_percent,
            memory: metrics.memory_percent,
            active_devices: self.streams.lock().len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        });
        self.alerts.publish(EngineEvent::PerformanceUpdate {
            packets_processed: self.pipeline.stats().packets_processed,
            network_errors: self.network_errors.load(Ordering::Relaxed),
            score: score.total,
        });

        self.check_resources(&metrics);
        if score.total < self.config.tuning.low_score {
            self.alerts.alert(
                AlertLevel::Warning,
                "performance",
                format!("Performance score {:.1} is low", score.total),
                json!({ "score": score.total, "weakest": score.weakest() }),
            );
        }
    }

    fn check_resources(&self, metrics: &SystemMetrics) {
        let thresholds = &self.config.alerts;
        self.resource_alert(
            "cpu",
            metrics.cpu_percent,
            thresholds.cpu_warning,
            thresholds.cpu_critical,
        );
        self.resource_alert(
            "memory",
            metrics.memory_percent,
            thresholds.memory_warning,
            thresholds.memory_critical,
        );
    }

    fn resource_alert(&self, resource: &str, value: f64, warning: f64, critical: f64) {
        let (level, threshold) = if value > critical {
            (AlertLevel::Critical, critical)
        } else if value > warning {
            (AlertLevel::Warning, warning)
        } else {
            return;
        };
        warn!("{} at {:.1} exceeds {:.1}", resource, value, threshold);
        self.alerts.publish(EngineEvent::ResourceAlert {
            resource: resource.to_string(),
            value,
            threshold,
            level,
        });
    }

    fn signals(&self, cpu_percent: f64) -> TuningSignals {
        let (mean_latency_ms, min_reliability) = {
            let health = self.health.lock();
            (health.mean_latency(), health.min_reliability())
        };
        TuningSignals {
            cpu_percent,
            mean_latency_ms,
            min_reliability,
            score: self.scorer.lock().latest().cloned(),
        }
    }

    fn on_tuning_tick(&self) {
        let signals = self.signals(self.sampler.sample().cpu_percent);
        let event = self
            .optimizer
            .lock()
            .on_tick(Instant::now(), &signals, self);
        if let Some(event) = event {
            self.record_tuning(event);
        }
    }

    fn trigger(&self, reason: TuningReason) -> Option<TuningEvent> {
        let signals = self.signals(self.sampler.sample().cpu_percent);
        let event = self
            .optimizer
            .lock()
            .on_trigger(Instant::now(), reason, &signals, self)?;
        self.record_tuning(event.clone());
        Some(event)
    }

    fn record_tuning(&self, event: TuningEvent) {
        if event.success {
            let summary = event
                .changes
                .iter()
                .map(ParameterChange::describe)
                .collect::<Vec<_>>()
                .join(", ");
            self.alerts.publish(EngineEvent::TuningApplied {
                reason: event.reason,
                changes: event.changes.clone(),
            });
            self.alerts.alert(
                AlertLevel::Info,
                "tuning",
                format!("Applied {} tuning: {}", event.reason, summary),
                json!({ "reason": event.reason, "changes": event.changes }),
            );
        } else {
            self.alerts.alert(
                AlertLevel::Error,
                "tuning",
                format!("Tuning for {} failed", event.reason),
                json!({ "reason": event.reason, "error": event.error }),
            );
        }
        self.tuning_log.lock().push(event);
    }

    fn record_buffer_adjustment(&self, adjustment: BufferAdjustment) -> BufferAdjustment {
        let event = DeviceEventKind::BufferAdjusted {
            from: adjustment.from,
            to: adjustment.to,
        };
        self.device_event(&adjustment.device, &event);
        self.health.lock().note(&adjustment.device, event);

        let changes = vec![ParameterChange::BufferSize {
            device: adjustment.device.clone(),
            from: adjustment.from,
            to: adjustment.to,
        }];
        self.alerts.publish(EngineEvent::TuningApplied {
            reason: adjustment.reason,
            changes: changes.clone(),
        });
        self.tuning_log
            .lock()
            .push(TuningEvent::new(adjustment.reason, changes, None));
        adjustment
    }

    fn device_event(&self, device: &DeviceId, event: &DeviceEventKind) {
        let reliability = self.health.lock().reliability(device);
        self.alerts.publish(EngineEvent::DeviceEvent {
            device_id: device.clone(),
            event: event.name().to_string(),
            reliability,
        });
    }

    fn spawn_probe_loop(self: &Arc<Self>, device: DeviceId, delay: Duration) {
        let token = self.cancel.child_token();
        if let Some(previous) = self.probe_loops.lock().insert(device.clone(), token.clone()) {
            previous.cancel();
        }

        let inner = self.clone();
        tokio::spawn(async move {
            if !sleep_or_cancel(&token, delay).await {
                return;
            }
            loop {
                inner.probe_once(&device, &token).await;
                let interval = inner.health.lock().ping_interval(&device);
                let Some(interval) = interval else {
                    break;
                };
                if !sleep_or_cancel(&token, interval).await {
                    break;
                }
            }
            debug!("Probe loop for {} stopped", device);
        });
    }

    /// One probe bounded by the device's timeout.
    async fn probe(&self, device: &DeviceId, token: &CancellationToken) -> Option<Result<Duration>> {
        let (host, port, timeout) = {
            let health = self.health.lock();
            let (host, port) = health.address(device)?;
            (host, port, health.probe_timeout(device)?)
        };

        let result = tokio::select! {
            _ = token.cancelled() => return None,
            result = tokio::time::timeout(timeout, self.controller.probe(device, &host, port)) => result,
        };
        Some(result.unwrap_or_else(|_| Err(Error::ProbeTimeout(timeout.as_millis() as u64))))
    }

    async fn probe_once(&self, device: &DeviceId, token: &CancellationToken) {
        let Some(result) = self.probe(device, token).await else {
            return;
        };

        match result {
            Ok(latency) => {
                self.health
                    .lock()
                    .record_success(device, latency, Instant::now());
                let latency_ms = latency.as_secs_f64() * 1000.0;
                self.device_event(device, &DeviceEventKind::ProbeSucceeded { latency_ms });

                // A failed recovery tore the buffer down but kept the stream.
                let streaming = self.streams.lock().contains_key(device);
                if streaming && self.buffers.lock().current_size(device).is_none() {
                    info!("Device {} is back, resuming its stream", device);
                    self.resume_stream(device).await;
                }

                let warning = self.config.alerts.latency_warning_ms;
                if latency_ms > warning {
                    self.alerts.publish(EngineEvent::ResourceAlert {
                        resource: format!("latency:{}", device),
                        value: latency_ms,
                        threshold: warning,
                        level: AlertLevel::Warning,
                    });
                }
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", device, e);
                self.network_errors.fetch_add(1, Ordering::Relaxed);
                let (verdict, failures) = {
                    let mut health = self.health.lock();
                    let verdict = health.record_failure(device, Instant::now());
                    let failures = health
                        .snapshot(device)
                        .map(|s| s.consecutive_failures)
                        .unwrap_or(0);
                    (verdict, failures)
                };
                self.device_event(
                    device,
                    &DeviceEventKind::ProbeFailed {
                        consecutive_failures: failures,
                    },
                );
                if verdict == Some(ProbeVerdict::NeedsRecovery) {
                    self.recover(device, failures, token).await;
                }
            }
        }
    }

    /// Stop, tear down, settle, re-probe, and resume streaming if the device
    /// was streaming. Runs inside the device's probe loop, so at most one
    /// recovery per device is in flight and the next scheduled probe waits.
    async fn recover(&self, device: &DeviceId, failures: u32, token: &CancellationToken) {
        if !self.health.lock().begin_recovery(device) {
            return;
        }
        warn!("Starting recovery of {} after {} failed probes", device, failures);
        self.device_event(device, &DeviceEventKind::RecoveryStarted);
        self.alerts.alert(
            AlertLevel::Warning,
            "device",
            format!("Device {} unresponsive, recovering", device),
            json!({ "device": device, "consecutiveFailures": failures }),
        );

        if let Err(e) = self.controller.stop(device).await {
            debug!("Stop during recovery of {} failed: {}", device, e);
        }
        self.buffers.lock().close(device);

        let settle = Duration::from_millis(self.config.health.settle_ms);
        if !sleep_or_cancel(token, settle).await {
            self.health.lock().finish_recovery(device, false);
            return;
        }

        let Some(result) = self.probe(device, token).await else {
            self.health.lock().finish_recovery(device, false);
            return;
        };

        match result {
            Ok(latency) => {
                {
                    let mut health = self.health.lock();
                    health.record_success(device, latency, Instant::now());
                    health.finish_recovery(device, true);
                }
                self.resume_stream(device).await;
                info!("Recovered {}", device);
                self.device_event(device, &DeviceEventKind::Recovered);
                self.alerts.alert(
                    AlertLevel::Info,
                    "device",
                    format!("Device {} recovered", device),
                    json!({ "device": device }),
                );
            }
            Err(e) => {
                self.network_errors.fetch_add(1, Ordering::Relaxed);
                {
                    let mut health = self.health.lock();
                    health.record_failure(device, Instant::now());
                    health.finish_recovery(device, false);
                }
                error!("Recovery of {} failed: {}", device, e);
                self.device_event(device, &DeviceEventKind::RecoveryFailed);
                self.alerts.alert(
                    AlertLevel::Critical,
                    "device",
                    format!("Recovery of device {} failed", device),
                    json!({ "device": device, "error": e.to_string() }),
                );
                self.trigger(TuningReason::UnreliableDevice);
            }
        }
    }

    async fn resume_stream(&self, device: &DeviceId) {
        let metadata = self.streams.lock().get(device).cloned();
        let Some(metadata) = metadata else {
            return;
        };
        self.buffers.lock().open(device);

        let Some(endpoint) = self.relay.endpoint_url(device) else {
            return;
        };
        if let Err(e) = self.controller.play(device, &endpoint, &metadata).await {
            self.alerts.alert(
                AlertLevel::Error,
                "device",
                format!("Could not resume stream on {}", device),
                json!({ "device": device, "error": e.to_string() }),
            );
        }
    }
}

impl TuningTarget for EngineInner {
    fn current(&self) -> TunableParams {
        let (worker_count, min_workers, max_workers) = match &self.pool {
            Some(pool) => {
                let stats = pool.stats();
                (stats.target_size, pool.min_size(), stats.max_size)
            }
            None => (0, 0, 0),
        };
        let (buffer_min, buffer_max) = self.buffers.lock().bounds();
        let health = self.health.lock();

        TunableParams {
            worker_count,
            min_workers,
            max_workers,
            buffer_min,
            buffer_max,
            buffer_floor: self.config.buffer.floor_size,
            buffer_ceiling: self.config.buffer.ceiling_size,
            health_interval_ms: health.base_interval_ms(),
            max_health_interval_ms: self.config.health.max_ping_interval_ms,
            max_probe_timeout_ms: self.config.health.max_probe_timeout_ms,
            devices: health.unreliable(self.config.tuning.unreliable_reliability),
        }
    }

    fn apply(&self, change: &ParameterChange) -> Result<()> {
        debug!("Applying {}", change.describe());
        match change {
            ParameterChange::WorkerCount { to, .. } => {
                let pool = self
                    .pool
                    .as_ref()
                    .ok_or_else(|| Error::TuningError("worker pool is disabled".to_string()))?;
                let applied = pool.resize(*to);
                if applied != *to {
                    return Err(Error::TuningError(format!(
                        "worker pool settled at {} instead of {}",
                        applied, to
                    )));
                }
                Ok(())
            }
            ParameterChange::BufferRange { to_min, to_max, .. } => {
                self.buffers.lock().set_bounds(*to_min, *to_max)
            }
            ParameterChange::HealthInterval { to_ms, .. } => {
                self.health.lock().set_base_interval(*to_ms)
            }
            ParameterChange::ProbeTimeout { device, to_ms, .. } => {
                self.health.lock().set_probe_timeout(device, *to_ms).map(|_| ())
            }
            ParameterChange::BufferSize { .. } => Err(Error::TuningError(
                "per-device buffer sizes are owned by the buffer controller".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct OkController {
        plays: AtomicU32,
    }

    #[async_trait]
    impl DeviceController for OkController {
        async fn probe(&self, _: &DeviceId, _: &str, _: u16) -> Result<Duration> {
            Ok(Duration::from_millis(20))
        }

        async fn set_volume(&self, _: &DeviceId, _: u8) -> Result<()> {
            Ok(())
        }

        async fn play(&self, _: &DeviceId, _: &str, _: &StreamMetadata) -> Result<()> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _: &DeviceId) -> Result<()> {
            Ok(())
        }
    }

    struct Relay;

    impl StreamRelay for Relay {
        fn endpoint_url(&self, device: &DeviceId) -> Option<String> {
            Some(format!("http://relay/{}", device))
        }
    }

    struct Idle;

    impl SystemSampler for Idle {
        fn sample(&self) -> SystemMetrics {
            SystemMetrics::default()
        }
    }

    fn engine() -> (Engine, Arc<OkController>) {
        let controller = Arc::new(OkController {
            plays: AtomicU32::new(0),
        });
        let collaborators = Collaborators::new(controller.clone(), Arc::new(Relay))
            .with_sampler(Arc::new(Idle));
        (
            Engine::start(EngineConfig::default(), collaborators).unwrap(),
            controller,
        )
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_start() {
        let mut config = EngineConfig::default();
        config.buffer.min_size = 900;
        let collaborators = Collaborators::new(
            Arc::new(OkController {
                plays: AtomicU32::new(0),
            }),
            Arc::new(Relay),
        );
        assert!(matches!(
            Engine::start(config, collaborators),
            Err(Error::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let (engine, controller) = engine();
        let device = DeviceId::from("kitchen");

        assert!(matches!(
            engine.open_stream(&device, StreamMetadata::default()).await,
            Err(Error::DeviceNotFound(_))
        ));

        assert!(engine.register_device(device.clone(), "10.0.0.2", 7000));
        assert!(!engine.register_device(device.clone(), "10.0.0.2", 7000));
        assert_eq!(
            engine.open_stream(&device, StreamMetadata::default()).await.unwrap(),
            250
        );
        assert_eq!(controller.plays.load(Ordering::SeqCst), 1);

        let outcome = engine.process(&device, Bytes::from_static(&[1, 0, 2, 0])).await;
        assert_eq!(outcome.into_bytes(), Some(Bytes::from_static(&[1, 0, 2, 0])));

        assert!(engine.close_stream(&device).await);
        assert!(matches!(
            engine.process(&device, Bytes::from_static(&[1, 0])).await,
            ProcessOutcome::Dropped(DropReason::StreamClosed)
        ));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_dropout_is_recorded_as_tuning_event() {
        let (engine, _) = engine();
        let device = DeviceId::from("den");
        engine.register_device(device.clone(), "10.0.0.3", 7000);
        engine
            .open_stream(&device, StreamMetadata::default())
            .await
            .unwrap();

        let mut events = engine.subscribe();
        let adjustment = engine.report_dropout(&device).unwrap();
        assert_eq!((adjustment.from, adjustment.to), (250, 350));

        let stats = engine.stats();
        let last = stats.tuning_history.last().unwrap();
        assert_eq!(last.reason, TuningReason::Dropout);
        assert_eq!(stats.buffer_states[&device].current_size, 350);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"tuningApplied"));
        assert!(names.contains(&"deviceEvent"));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_manual_worker_override_is_logged() {
        let (engine, _) = engine();
        let before = engine.stats().workers.unwrap().target_size;
        let after = engine.set_worker_count(1).unwrap();
        assert_eq!(after, 1);

        let stats = engine.stats();
        let event = stats.tuning_history.last().unwrap();
        assert_eq!(event.reason, TuningReason::Manual);
        assert_eq!(
            event.changes,
            vec![ParameterChange::WorkerCount {
                from: before,
                to: 1
            }]
        );
        assert_eq!(stats.tuning_phase, TuningPhase::Idle);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_expose_score_history() {
        let (engine, _) = engine();
        assert!(engine.stats().score_history.is_empty());

        let period = Duration::from_millis(EngineConfig::default().scoring.tick_ms);
        tokio::time::sleep(period * 2 + Duration::from_secs(1)).await;

        let stats = engine.stats();
        assert_eq!(stats.score_history.len(), 2);
        assert_eq!(stats.score_trend, 0.0);
        assert_eq!(stats.score, stats.score_history.last().cloned());
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_drops_new_chunks() {
        let (engine, _) = engine();
        engine.shutdown();
        assert!(engine.is_shut_down());
        assert!(!engine.register_device("late".into(), "10.0.0.9", 7000));
        assert!(matches!(
            engine.process(&"late".into(), Bytes::new()).await,
            ProcessOutcome::Dropped(DropReason::ShuttingDown)
        ));
    }
}
