//! Per-chunk dispatch between the worker pool and the in-process fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{DeviceId, DropReason, ProcessOutcome};
use super::worker_pool::WorkerPool;
use crate::audio::ChunkProcessor;
use crate::config::WorkerPoolConfig;
use crate::error::Error;

/// Counters shared by every caller; updated atomically.
#[derive(Debug, Default)]
struct PipelineCounters {
    packets_processed: AtomicU64,
    bytes_processed: AtomicU64,
    processing_errors: AtomicU64,
    fallback_count: AtomicU64,
    backpressure_count: AtomicU64,
    total_processing_us: AtomicU64,
    last_processing_us: AtomicU64,
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub processing_errors: u64,
    pub fallback_count: u64,
    pub backpressure_count: u64,
    pub avg_processing_ms: f64,
    pub last_processing_ms: f64,
}

/// Audio processing pipeline.
pub struct AudioProcessingPipeline {
    pool: Option<Arc<WorkerPool>>,
    processor: Arc<dyn ChunkProcessor>,
    fallback_permits: Arc<Semaphore>,
    task_timeout: Duration,
    counters: PipelineCounters,
}

impl AudioProcessingPipeline {
    pub fn new(
        config: &WorkerPoolConfig,
        pool: Option<Arc<WorkerPool>>,
        processor: Arc<dyn ChunkProcessor>,
    ) -> Self {
        Self {
            pool: pool.filter(|_| config.enabled),
            processor,
            fallback_permits: Arc::new(Semaphore::new(config.fallback_concurrency.max(1))),
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            counters: PipelineCounters::default(),
        }
    }

    /// Process one chunk with the device's current buffer size.
    ///
    /// Never fails: errors turn into a dropped chunk, and saturation of both
    /// paths turns into `NotReady` for the source.
    pub async fn process(&self, device: &DeviceId, chunk: Bytes, buffer_size: u32) -> ProcessOutcome {
        let started = Instant::now();
        let len = chunk.len() as u64;

        let result = match &self.pool {
            Some(pool) => match pool.submit(device, chunk.clone(), buffer_size).await {
                Err(Error::PoolSaturated) => self.fallback(device, chunk, buffer_size).await,
                Err(Error::WorkerCrashed(id)) => {
                    debug!("Retrying chunk for {} in-process after worker {} crash", device, id);
                    self.fallback(device, chunk, buffer_size).await
                }
                other => Some(other),
            },
            None => self.fallback(device, chunk, buffer_size).await,
        };

        let Some(result) = result else {
            self.counters.backpressure_count.fetch_add(1, Ordering::Relaxed);
            return ProcessOutcome::NotReady;
        };

        self.counters.packets_processed.fetch_add(1, Ordering::Relaxed);
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.counters.total_processing_us.fetch_add(elapsed_us, Ordering::Relaxed);
        self.counters.last_processing_us.store(elapsed_us, Ordering::Relaxed);

        match result {
            Ok(out) => {
                self.counters.bytes_processed.fetch_add(len, Ordering::Relaxed);
                ProcessOutcome::Processed(out)
            }
            Err(e) => {
                self.counters.processing_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping chunk for {}: {}", device, e);
                ProcessOutcome::Dropped(match e {
                    Error::ProcessingTimeout(_) => DropReason::Timeout,
                    Error::PoolShutdown => DropReason::ShuttingDown,
                    _ => DropReason::ProcessingFailed,
                })
            }
        }
    }

    /// In-process path. `None` means no fallback capacity is left.
    async fn fallback(
        &self,
        device: &DeviceId,
        chunk: Bytes,
        buffer_size: u32,
    ) -> Option<crate::error::Result<Bytes>> {
        let permit = self.fallback_permits.clone().try_acquire_owned().ok()?;
        self.counters.fallback_count.fetch_add(1, Ordering::Relaxed);

        let processor = self.processor.clone();
        let device = device.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            processor.process(&device, chunk, buffer_size)
        });

        Some(match tokio::time::timeout(self.task_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::ProcessingError(format!(
                "in-process processing panicked: {}",
                join
            ))),
            Err(_) => Err(Error::ProcessingTimeout(self.task_timeout.as_millis() as u64)),
        })
    }

    /// Whether a chunk submitted now would be accepted by some path.
    pub fn is_ready(&self) -> bool {
        self.pool.as_ref().map(|p| p.has_free_worker()).unwrap_or(false)
            || self.fallback_permits.available_permits() > 0
    }

    pub fn stats(&self) -> PipelineStats {
        let packets = self.counters.packets_processed.load(Ordering::Relaxed);
        let total_us = self.counters.total_processing_us.load(Ordering::Relaxed);
        PipelineStats {
            packets_processed: packets,
            bytes_processed: self.counters.bytes_processed.load(Ordering::Relaxed),
            processing_errors: self.counters.processing_errors.load(Ordering::Relaxed),
            fallback_count: self.counters.fallback_count.load(Ordering::Relaxed),
            backpressure_count: self.counters.backpressure_count.load(Ordering::Relaxed),
            avg_processing_ms: if packets > 0 {
                total_us as f64 / packets as f64 / 1000.0
            } else {
                0.0
            },
            last_processing_ms: self.counters.last_processing_us.load(Ordering::Relaxed) as f64
                / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PcmGainProcessor;
    use crate::error::Result;
    use std::sync::atomic::AtomicBool;

    struct PanicOnce(AtomicBool);

    impl ChunkProcessor for PanicOnce {
        fn process(&self, _: &DeviceId, chunk: Bytes, _: u32) -> Result<Bytes> {
            if !self.0.swap(true, Ordering::SeqCst) {
                panic!("simulated worker failure");
            }
            Ok(chunk)
        }
    }

    struct Blocking;

    impl ChunkProcessor for Blocking {
        fn process(&self, _: &DeviceId, chunk: Bytes, _: u32) -> Result<Bytes> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(chunk)
        }
    }

    fn config(enabled: bool) -> WorkerPoolConfig {
        WorkerPoolConfig {
            enabled,
            max_workers: 1,
            worker_cap: 1,
            fallback_concurrency: 1,
            task_timeout_ms: 1000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_in_process_when_pool_disabled() {
        let processor: Arc<dyn ChunkProcessor> = Arc::new(PcmGainProcessor::default());
        let pipeline = AudioProcessingPipeline::new(&config(false), None, processor);
        let outcome = pipeline
            .process(&"d".into(), Bytes::from_static(&[0, 1]), 250)
            .await;
        assert!(matches!(outcome, ProcessOutcome::Processed(_)));

        let stats = pipeline.stats();
        assert_eq!(stats.packets_processed, 1);
        assert_eq!(stats.fallback_count, 1);
    }

    #[tokio::test]
    async fn test_errors_become_drops() {
        let processor: Arc<dyn ChunkProcessor> = Arc::new(PcmGainProcessor::new(0.5));
        let pipeline = AudioProcessingPipeline::new(&config(false), None, processor);
        let outcome = pipeline
            .process(&"d".into(), Bytes::from_static(&[0, 1, 2]), 250)
            .await;
        assert!(matches!(
            outcome,
            ProcessOutcome::Dropped(DropReason::ProcessingFailed)
        ));
        assert_eq!(pipeline.stats().processing_errors, 1);
        assert_eq!(pipeline.stats().packets_processed, 1);
    }

    #[tokio::test]
    async fn test_crash_falls_back_once() {
        let cfg = config(true);
        let processor: Arc<dyn ChunkProcessor> = Arc::new(PanicOnce(AtomicBool::new(false)));
        let pool = Arc::new(WorkerPool::new(&cfg, processor.clone()).unwrap());
        let pipeline = AudioProcessingPipeline::new(&cfg, Some(pool.clone()), processor);

        let outcome = pipeline
            .process(&"d".into(), Bytes::from_static(&[4, 0]), 250)
            .await;
        assert_eq!(
            outcome.into_bytes(),
            Some(Bytes::from_static(&[4, 0]))
        );
        assert_eq!(pool.stats().restarts, 1);
        assert_eq!(pipeline.stats().fallback_count, 1);
    }

    #[tokio::test]
    async fn test_backpressure_when_everything_busy() {
        let cfg = config(false);
        let processor: Arc<dyn ChunkProcessor> = Arc::new(Blocking);
        let pipeline = Arc::new(AudioProcessingPipeline::new(&cfg, None, processor));

        let busy = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .process(&"d".into(), Bytes::from_static(&[0, 0]), 250)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pipeline.is_ready());

        let outcome = pipeline
            .process(&"d".into(), Bytes::from_static(&[0, 0]), 250)
            .await;
        assert!(matches!(outcome, ProcessOutcome::NotReady));
        assert_eq!(pipeline.stats().backpressure_count, 1);

        assert!(matches!(busy.await.unwrap(), ProcessOutcome::Processed(_)));
        assert!(pipeline.is_ready());
    }
}
