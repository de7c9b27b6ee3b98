//! Bounded pool of chunk-processing workers.
//!
//! Each worker is a dedicated OS thread fed through its own task channel;
//! results come back on a per-task oneshot, so no correlation bookkeeping is
//! needed. The pool:
//! - picks the least-loaded free worker, rotating among equally loaded ones
//! - enforces a hard per-task timeout and restarts wedged workers
//! - replaces crashed workers in place with a fresh one
//! - can be resized at runtime within `[min_workers, effective max]`

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{wall_clock, DeviceId, WorkerId};
use crate::audio::ChunkProcessor;
use crate::config::WorkerPoolConfig;
use crate::error::{Error, Result};

/// A unit of work handed to a worker thread.
struct Task {
    device: DeviceId,
    chunk: Bytes,
    buffer_size: u32,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// Pool-side bookkeeping for one worker.
struct WorkerSlot {
    id: WorkerId,
    /// Bumped on every restart so stale guards cannot touch the replacement
    generation: u64,
    tx: Option<mpsc::Sender<Task>>,
    busy: bool,
    tasks_completed: u64,
    last_used_at: Option<Instant>,
    /// Marked for removal after a shrink; leaves once idle
    retiring: bool,
}

struct PoolState {
    slots: Vec<WorkerSlot>,
    target_size: usize,
    cursor: usize,
    restarts: u64,
    next_generation: u64,
    shut_down: bool,
}

/// Read-only view of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub busy: bool,
    pub tasks_completed: u64,
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Pool statistics consumed by the scorer and `Engine::stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub target_size: usize,
    pub max_size: usize,
    pub busy_count: usize,
    pub restarts: u64,
    pub tasks_completed: u64,
    pub workers: Vec<WorkerSnapshot>,
}

/// Bounded worker pool.
pub struct WorkerPool {
    processor: Arc<dyn ChunkProcessor>,
    state: Mutex<PoolState>,
    task_timeout: Duration,
    min_size: usize,
    max_size: usize,
    shutdown: CancellationToken,
}

fn spawn_worker(
    id: WorkerId,
    processor: Arc<dyn ChunkProcessor>,
) -> std::io::Result<mpsc::Sender<Task>> {
    let (tx, mut rx) = mpsc::channel::<Task>(1);
    std::thread::Builder::new()
        .name(format!("streamtune-worker-{}", id))
        .spawn(move || {
            while let Some(task) = rx.blocking_recv() {
                let result = processor.process(&task.device, task.chunk, task.buffer_size);
                // The caller may have timed out already.
                let _ = task.reply.send(result);
            }
            debug!("Worker {} exiting", id);
        })?;
    Ok(tx)
}

impl WorkerPool {
    /// Create a pool sized `min(max_workers, cpu count, worker_cap)`.
    pub fn new(config: &WorkerPoolConfig, processor: Arc<dyn ChunkProcessor>) -> Result<Self> {
        let max_size = config.effective_max();
        let min_size = config.min_workers.clamp(1, max_size);

        let mut slots = Vec::with_capacity(max_size);
        for id in 0..max_size {
            let tx = spawn_worker(id, processor.clone())?;
            slots.push(WorkerSlot {
                id,
                generation: 0,
                tx: Some(tx),
                busy: false,
                tasks_completed: 0,
                last_used_at: None,
                retiring: false,
            });
        }

        info!("Worker pool started with {} workers", max_size);

        Ok(Self {
            processor,
            state: Mutex::new(PoolState {
                slots,
                target_size: max_size,
                cursor: 0,
                restarts: 0,
                next_generation: 1,
                shut_down: false,
            }),
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            min_size,
            max_size,
            shutdown: CancellationToken::new(),
        })
    }

    /// Process a chunk on a free worker.
    ///
    /// Returns `PoolSaturated` at once when every worker is busy so the caller
    /// can pick another path; the chunk is never dropped silently here.
    pub async fn submit(&self, device: &DeviceId, chunk: Bytes, buffer_size: u32) -> Result<Bytes> {
        let (id, generation, tx) = self.acquire()?;
        let mut guard = SlotGuard {
            pool: self,
            id,
            generation,
            armed: true,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let task = Task {
            device: device.clone(),
            chunk,
            buffer_size,
            reply: reply_tx,
        };

        if tx.try_send(task).is_err() {
            guard.armed = false;
            warn!("Worker {} channel closed before dispatch", id);
            self.restart(id, generation, "channel closed");
            return Err(Error::WorkerCrashed(id));
        }

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => {
                guard.armed = false;
                return Err(Error::PoolShutdown);
            }
            outcome = tokio::time::timeout(self.task_timeout, reply_rx) => outcome,
        };

        guard.armed = false;
        match outcome {
            Ok(Ok(result)) => {
                self.release(id, generation, true);
                result
            }
            Ok(Err(_)) => {
                error!("Worker {} crashed while processing a chunk for {}", id, device);
                self.restart(id, generation, "crashed");
                Err(Error::WorkerCrashed(id))
            }
            Err(_) => {
                let ms = self.task_timeout.as_millis() as u64;
                warn!("Worker {} timed out after {} ms, restarting", id, ms);
                self.restart(id, generation, "timed out");
                Err(Error::ProcessingTimeout(ms))
            }
        }
    }

    fn acquire(&self) -> Result<(WorkerId, u64, mpsc::Sender<Task>)> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(Error::PoolShutdown);
        }

        // Slots whose respawn failed earlier get another attempt.
        for slot in state.slots.iter_mut().filter(|s| s.tx.is_none() && !s.retiring) {
            match spawn_worker(slot.id, self.processor.clone()) {
                Ok(tx) => {
                    info!("Worker {} respawned", slot.id);
                    slot.tx = Some(tx);
                }
                Err(e) => warn!("Worker {} still cannot be spawned: {}", slot.id, e),
            }
        }

        let span = state.slots.iter().map(|s| s.id + 1).max().unwrap_or(1);
        let cursor = state.cursor;
        let chosen = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.busy && !s.retiring && s.tx.is_some())
            .min_by_key(|(_, s)| (s.tasks_completed, (s.id + span - cursor % span) % span))
            .map(|(index, _)| index);

        let index = chosen.ok_or(Error::PoolSaturated)?;
        state.cursor = state.slots[index].id + 1;

        let slot = &mut state.slots[index];
        slot.busy = true;
        slot.last_used_at = Some(Instant::now());
        let tx = slot.tx.clone().ok_or(Error::PoolSaturated)?;
        Ok((slot.id, slot.generation, tx))
    }

    fn release(&self, id: WorkerId, generation: u64, completed: bool) {
        let mut state = self.state.lock();
        let Some(index) = state
            .slots
            .iter()
            .position(|s| s.id == id && s.generation == generation)
        else {
            return;
        };

        let slot = &mut state.slots[index];
        slot.busy = false;
        if completed {
            slot.tasks_completed += 1;
        }
        if slot.retiring {
            debug!("Retiring worker {}", id);
            state.slots.remove(index);
        }
    }

    /// Replace a wedged or crashed worker with a fresh one in the same slot.
    fn restart(&self, id: WorkerId, generation: u64, why: &str) {
        let mut state = self.state.lock();
        let Some(index) = state
            .slots
            .iter()
            .position(|s| s.id == id && s.generation == generation)
        else {
            return;
        };

        if state.shut_down || state.slots[index].retiring {
            state.slots.remove(index);
            return;
        }

        let new_generation = state.next_generation;
        state.next_generation += 1;
        state.restarts += 1;

        let tx = match spawn_worker(id, self.processor.clone()) {
            Ok(tx) => Some(tx),
            Err(e) => {
                error!("Failed to respawn worker {}: {}", id, e);
                None
            }
        };

        info!("Worker {} {}, replacement started", id, why);
        state.slots[index] = WorkerSlot {
            id,
            generation: new_generation,
            tx,
            busy: false,
            tasks_completed: 0,
            last_used_at: None,
            retiring: false,
        };
    }

    /// Grow or shrink the pool. Returns the new target size.
    pub fn resize(&self, size: usize) -> usize {
        let target = size.clamp(self.min_size, self.max_size);
        let mut state = self.state.lock();
        if state.shut_down {
            return state.target_size;
        }
        let previous = state.target_size;
        state.target_size = target;

        // Revive retiring workers first.
        let mut active = state.slots.iter().filter(|s| !s.retiring).count();
        for slot in state.slots.iter_mut().filter(|s| s.retiring) {
            if active >= target {
                break;
            }
            slot.retiring = false;
            active += 1;
        }

        while active < target {
            let id = (0..)
                .find(|candidate| state.slots.iter().all(|s| s.id != *candidate))
                .unwrap_or(active);
            let generation = state.next_generation;
            state.next_generation += 1;
            match spawn_worker(id, self.processor.clone()) {
                Ok(tx) => state.slots.push(WorkerSlot {
                    id,
                    generation,
                    tx: Some(tx),
                    busy: false,
                    tasks_completed: 0,
                    last_used_at: None,
                    retiring: false,
                }),
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", id, e);
                    break;
                }
            }
            active += 1;
        }

        if active > target {
            let mut excess = active - target;
            let mut ids: Vec<WorkerId> = state
                .slots
                .iter()
                .filter(|s| !s.retiring)
                .map(|s| s.id)
                .collect();
            ids.sort_unstable_by(|a, b| b.cmp(a));
            for id in ids {
                if excess == 0 {
                    break;
                }
                if let Some(slot) = state.slots.iter_mut().find(|s| s.id == id) {
                    slot.retiring = true;
                    excess -= 1;
                }
            }
            state.slots.retain(|s| !s.retiring || s.busy);
        }

        state.slots.sort_by_key(|s| s.id);
        if previous != target {
            info!("Worker pool resized {} -> {}", previous, target);
        }
        target
    }

    /// Target number of workers.
    pub fn size(&self) -> usize {
        self.state.lock().target_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn has_free_worker(&self) -> bool {
        let state = self.state.lock();
        !state.shut_down
            && state
                .slots
                .iter()
                .any(|s| !s.busy && !s.retiring && s.tx.is_some())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            size: state.slots.len(),
            target_size: state.target_size,
            max_size: self.max_size,
            busy_count: state.slots.iter().filter(|s| s.busy).count(),
            restarts: state.restarts,
            tasks_completed: state.slots.iter().map(|s| s.tasks_completed).sum(),
            workers: state
                .slots
                .iter()
                .map(|s| WorkerSnapshot {
                    id: s.id,
                    busy: s.busy,
                    tasks_completed: s.tasks_completed,
                    last_used_at: s.last_used_at.map(wall_clock),
                })
                .collect(),
        }
    }

    /// Stop every worker. Pending submissions resolve with `PoolShutdown`;
    /// wedged threads are abandoned rather than joined.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.slots.clear();
        self.shutdown.cancel();
        info!("Worker pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Frees a worker slot if the submitting future is dropped mid-flight.
struct SlotGuard<'a> {
    pool: &'a WorkerPool,
    id: WorkerId,
    generation: u64,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.id, self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PcmGainProcessor;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(max: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: max,
            worker_cap: max,
            task_timeout_ms: 200,
            ..Default::default()
        }
    }

    /// Sleeps long enough to trip the pool timeout on the first call.
    struct SlowOnce(AtomicBool);

    impl ChunkProcessor for SlowOnce {
        fn process(&self, _: &DeviceId, chunk: Bytes, _: u32) -> Result<Bytes> {
            if !self.0.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(600));
            }
            Ok(chunk)
        }
    }

    struct PanicOnce(AtomicBool);

    impl ChunkProcessor for PanicOnce {
        fn process(&self, _: &DeviceId, chunk: Bytes, _: u32) -> Result<Bytes> {
            if !self.0.swap(true, Ordering::SeqCst) {
                panic!("simulated worker failure");
            }
            Ok(chunk)
        }
    }

    #[tokio::test]
    async fn test_submit_processes_chunk() {
        let pool = WorkerPool::new(&config(2), Arc::new(PcmGainProcessor::default())).unwrap();
        let chunk = Bytes::from_static(&[1, 0, 2, 0]);
        let out = pool.submit(&"d".into(), chunk.clone(), 250).await.unwrap();
        assert_eq!(out, chunk);

        let stats = pool.stats();
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.busy_count, 0);
    }

    #[tokio::test]
    async fn test_load_leveling_spreads_tasks() {
        let pool = WorkerPool::new(&config(2), Arc::new(PcmGainProcessor::default())).unwrap();
        let size = pool.max_size();
        for _ in 0..(size * 3) {
            pool.submit(&"d".into(), Bytes::from_static(&[0, 0]), 250)
                .await
                .unwrap();
        }
        let stats = pool.stats();
        for worker in &stats.workers {
            assert_eq!(worker.tasks_completed, 3);
        }
    }

    #[tokio::test]
    async fn test_crash_restarts_worker() {
        let pool = WorkerPool::new(
            &config(1),
            Arc::new(PanicOnce(AtomicBool::new(false))),
        )
        .unwrap();

        let err = pool
            .submit(&"d".into(), Bytes::from_static(&[0, 0]), 250)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerCrashed(0)));

        let stats = pool.stats();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.size, pool.size());
        assert_eq!(stats.workers[0].tasks_completed, 0);

        assert!(pool
            .submit(&"d".into(), Bytes::from_static(&[0, 0]), 250)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_restarts_worker() {
        let pool = WorkerPool::new(&config(1), Arc::new(SlowOnce(AtomicBool::new(false)))).unwrap();
        let err = pool
            .submit(&"d".into(), Bytes::from_static(&[0, 0]), 250)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessingTimeout(200)));
        assert_eq!(pool.stats().restarts, 1);
        assert!(pool.has_free_worker());
    }

    #[tokio::test]
    async fn test_empty_slot_respawned_on_next_submit() {
        let pool = WorkerPool::new(&config(1), Arc::new(PcmGainProcessor::default())).unwrap();
        pool.state.lock().slots[0].tx = None;
        assert!(!pool.has_free_worker());

        let out = pool
            .submit(&"d".into(), Bytes::from_static(&[4, 0]), 250)
            .await
            .unwrap();
        assert_eq!(out, Bytes::from_static(&[4, 0]));
        assert!(pool.has_free_worker());
        assert_eq!(pool.stats().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_resize_round_trip() {
        let pool = WorkerPool::new(&config(4), Arc::new(PcmGainProcessor::default())).unwrap();
        let original = pool.size();
        let reduced = pool.resize(original - 1);
        assert_eq!(reduced, original.saturating_sub(1).max(pool.min_size()));
        assert_eq!(pool.stats().size, reduced);
        assert_eq!(pool.resize(original), original);
        assert_eq!(pool.stats().size, original);
    }

    #[tokio::test]
    async fn test_resize_is_clamped() {
        let pool = WorkerPool::new(&config(2), Arc::new(PcmGainProcessor::default())).unwrap();
        assert_eq!(pool.resize(0), pool.min_size());
        assert_eq!(pool.resize(100), pool.max_size());
        assert!(pool.stats().size <= pool.max_size());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_submissions() {
        let pool = WorkerPool::new(&config(2), Arc::new(PcmGainProcessor::default())).unwrap();
        pool.shutdown();
        let err = pool
            .submit(&"d".into(), Bytes::from_static(&[0, 0]), 250)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolShutdown));
        assert_eq!(pool.stats().size, 0);
    }
}
