//! Adaptive per-device buffer sizing.
//!
//! Each streaming device carries a buffer depth that grows on underruns and
//! dropouts and shrinks on sustained overruns. Decisions use sliding time
//! windows and a per-device cooldown so that competing rules cannot thrash.
//!
//! All transitions take an explicit `now` so they are deterministic under test.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BufferConfig;
use crate::engine::types::{wall_clock, DeviceId, TuningReason};
use crate::error::{Error, Result};

/// Read-only view of one device's buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferState {
    pub current_size: u32,
    pub min_size: u32,
    pub max_size: u32,
    /// Underruns inside the current underrun window
    pub underrun_count: usize,
    /// Overruns inside the current overrun window
    pub overrun_count: usize,
    pub last_adjustment_at: Option<chrono::DateTime<chrono::Utc>>,
    pub cooldown_ms: u64,
}

/// An applied buffer size change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAdjustment {
    pub device: DeviceId,
    pub reason: TuningReason,
    pub from: u32,
    pub to: u32,
}

/// Audio quality signals accumulated since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCounters {
    pub underruns: u64,
    pub overruns: u64,
    pub dropouts: u64,
}

#[derive(Debug)]
struct DeviceBuffer {
    current_size: u32,
    min_size: u32,
    max_size: u32,
    /// Underruns counted toward the next increase; cleared after one
    underruns: VecDeque<Instant>,
    /// Every underrun in the overrun window, never cleared by adjustments
    underrun_history: VecDeque<Instant>,
    overruns: VecDeque<Instant>,
    last_adjustment_at: Option<Instant>,
}

impl DeviceBuffer {
    fn in_cooldown(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_adjustment_at
            .map(|at| now.saturating_duration_since(at) < cooldown)
            .unwrap_or(false)
    }
}

fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = events.front() {
        if now.saturating_duration_since(front) > window {
            events.pop_front();
        } else {
            break;
        }
    }
}

/// Per-device buffer state machine. Single owner of every `BufferState`.
pub struct AdaptiveBufferController {
    config: BufferConfig,
    devices: HashMap<DeviceId, DeviceBuffer>,
    counters: AudioCounters,
}

impl AdaptiveBufferController {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            devices: HashMap::new(),
            counters: AudioCounters::default(),
        }
    }

    /// Start tracking a device that begins streaming. Idempotent.
    pub fn open(&mut self, device: &DeviceId) -> u32 {
        let config = &self.config;
        let buffer = self.devices.entry(device.clone()).or_insert_with(|| {
            debug!("Opening buffer for {} at {} ms", device, config.initial_size);
            DeviceBuffer {
                current_size: config.initial_size.clamp(config.min_size, config.max_size),
                min_size: config.min_size,
                max_size: config.max_size,
                underruns: VecDeque::new(),
                underrun_history: VecDeque::new(),
                overruns: VecDeque::new(),
                last_adjustment_at: None,
            }
        });
        buffer.current_size
    }

    /// Drop a device's state when its tunnel closes.
    pub fn close(&mut self, device: &DeviceId) -> bool {
        self.devices.remove(device).is_some()
    }

    pub fn current_size(&self, device: &DeviceId) -> Option<u32> {
        self.devices.get(device).map(|b| b.current_size)
    }

    pub fn on_underrun(&mut self, device: &DeviceId, now: Instant) -> Option<BufferAdjustment> {
        self.counters.underruns += 1;
        let window = Duration::from_millis(self.config.underrun_window_ms);
        let history_window = Duration::from_millis(self.config.overrun_window_ms);
        let threshold = self.config.underrun_threshold;
        let step = self.config.underrun_step as i64;

        let buffer = self.devices.get_mut(device)?;
        buffer.underruns.push_back(now);
        buffer.underrun_history.push_back(now);
        prune(&mut buffer.underruns, now, window);
        prune(&mut buffer.underrun_history, now, history_window);

        if buffer.underruns.len() < threshold {
            return None;
        }

        let adjustment = self.adjust(device, step, TuningReason::Underrun, now)?;
        if let Some(buffer) = self.devices.get_mut(device) {
            buffer.underruns.clear();
        }
        Some(adjustment)
    }

    pub fn on_overrun(&mut self, device: &DeviceId, now: Instant) -> Option<BufferAdjustment> {
        self.counters.overruns += 1;
        let window = Duration::from_millis(self.config.overrun_window_ms);
        let threshold = self.config.overrun_threshold;
        let step = -(self.config.overrun_step as i64);

        let buffer = self.devices.get_mut(device)?;
        buffer.overruns.push_back(now);
        prune(&mut buffer.overruns, now, window);
        prune(&mut buffer.underrun_history, now, window);

        // Any underrun in the window suppresses shrinking.
        if buffer.overruns.len() < threshold || !buffer.underrun_history.is_empty() {
            return None;
        }

        let adjustment = self.adjust(device, step, TuningReason::Overrun, now)?;
        if let Some(buffer) = self.devices.get_mut(device) {
            buffer.overruns.clear();
        }
        Some(adjustment)
    }

    pub fn on_dropout(&mut self, device: &DeviceId, now: Instant) -> Option<BufferAdjustment> {
        self.counters.dropouts += 1;
        let step = self.config.dropout_step as i64;
        self.adjust(device, step, TuningReason::Dropout, now)
    }

    fn adjust(
        &mut self,
        device: &DeviceId,
        delta: i64,
        reason: TuningReason,
        now: Instant,
    ) -> Option<BufferAdjustment> {
        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        let buffer = self.devices.get_mut(device)?;

        if buffer.min_size == buffer.max_size {
            return None;
        }
        if buffer.in_cooldown(now, cooldown) {
            debug!("Buffer adjustment for {} ({}) suppressed by cooldown", device, reason);
            return None;
        }

        let from = buffer.current_size;
        let to = (from as i64 + delta).clamp(buffer.min_size as i64, buffer.max_size as i64) as u32;
        if to == from {
            return None;
        }

        buffer.current_size = to;
        buffer.last_adjustment_at = Some(now);
        info!("Buffer for {} adjusted {} -> {} ms ({})", device, from, to, reason);

        Some(BufferAdjustment {
            device: device.clone(),
            reason,
            from,
            to,
        })
    }

    /// Current (min, max) bounds applied to newly opened devices.
    pub fn bounds(&self) -> (u32, u32) {
        (self.config.min_size, self.config.max_size)
    }

    /// Move the allowed range for every device, clamping current sizes into it.
    pub fn set_bounds(&mut self, min_size: u32, max_size: u32) -> Result<()> {
        if min_size > max_size {
            return Err(Error::TuningError(format!(
                "buffer range {}..={} is empty",
                min_size, max_size
            )));
        }
        self.config.min_size = min_size;
        self.config.max_size = max_size;
        for buffer in self.devices.values_mut() {
            buffer.min_size = min_size;
            buffer.max_size = max_size;
            buffer.current_size = buffer.current_size.clamp(min_size, max_size);
        }
        Ok(())
    }

    pub fn state(&self, device: &DeviceId) -> Option<BufferState> {
        self.devices.get(device).map(|b| self.snapshot(b))
    }

    pub fn states(&self) -> HashMap<DeviceId, BufferState> {
        self.devices
            .iter()
            .map(|(id, b)| (id.clone(), self.snapshot(b)))
            .collect()
    }

    fn snapshot(&self, buffer: &DeviceBuffer) -> BufferState {
        BufferState {
            current_size: buffer.current_size,
            min_size: buffer.min_size,
            max_size: buffer.max_size,
            underrun_count: buffer.underruns.len(),
            overrun_count: buffer.overruns.len(),
            last_adjustment_at: buffer.last_adjustment_at.map(wall_clock),
            cooldown_ms: self.config.cooldown_ms,
        }
    }

    /// Signals observed since the previous call; resets the counters.
    pub fn take_audio_counters(&mut self) -> AudioCounters {
        std::mem::take(&mut self.counters)
    }

    pub fn audio_counters(&self) -> AudioCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveBufferController {
        AdaptiveBufferController::new(BufferConfig::default())
    }

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    #[test]
    fn test_open_uses_initial_size() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        assert_eq!(c.open(&d), 250);
        assert_eq!(c.current_size(&d), Some(250));
        assert!(c.close(&d));
        assert_eq!(c.current_size(&d), None);
    }

    #[test]
    fn test_three_underruns_increase_once() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();

        assert!(c.on_underrun(&d, t0).is_none());
        assert!(c.on_underrun(&d, secs(t0, 1)).is_none());
        let adj = c.on_underrun(&d, secs(t0, 2)).unwrap();
        assert_eq!((adj.from, adj.to), (250, 300));
        assert_eq!(adj.reason, TuningReason::Underrun);
        assert!(c.on_underrun(&d, secs(t0, 3)).is_none());
        assert_eq!(c.current_size(&d), Some(300));
    }

    #[test]
    fn test_underruns_outside_window_expire() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();

        c.on_underrun(&d, t0);
        c.on_underrun(&d, secs(t0, 30));
        assert!(c.on_underrun(&d, secs(t0, 70)).is_none());
        assert_eq!(c.state(&d).unwrap().underrun_count, 2);
    }

    #[test]
    fn test_dropout_bypasses_threshold() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let adj = c.on_dropout(&d, Instant::now()).unwrap();
        assert_eq!((adj.from, adj.to), (250, 350));
    }

    #[test]
    fn test_cooldown_applies_across_rules() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();

        assert!(c.on_dropout(&d, t0).is_some());
        assert!(c.on_dropout(&d, t0 + Duration::from_millis(4999)).is_none());
        let adj = c.on_dropout(&d, t0 + Duration::from_millis(5000)).unwrap();
        assert_eq!((adj.from, adj.to), (350, 450));
    }

    #[test]
    fn test_increase_clamped_to_max() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();
        c.on_dropout(&d, t0);
        c.on_dropout(&d, secs(t0, 6));
        let adj = c.on_dropout(&d, secs(t0, 12)).unwrap();
        assert_eq!(adj.to, 500);
        assert!(c.on_dropout(&d, secs(t0, 18)).is_none());
    }

    #[test]
    fn test_overruns_shrink_without_underruns() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();

        for i in 0..9 {
            assert!(c.on_overrun(&d, secs(t0, i)).is_none());
        }
        let adj = c.on_overrun(&d, secs(t0, 9)).unwrap();
        assert_eq!((adj.from, adj.to), (250, 225));
        assert_eq!(c.state(&d).unwrap().overrun_count, 0);
    }

    #[test]
    fn test_underrun_in_window_blocks_overrun_rule() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();

        c.on_underrun(&d, t0);
        for i in 1..=20 {
            assert!(c.on_overrun(&d, secs(t0, i)).is_none());
        }
        // the underrun ages out of the 120 s window
        assert!(c.on_overrun(&d, secs(t0, 121)).is_some());
    }

    #[test]
    fn test_equal_bounds_never_adjust() {
        let mut c = AdaptiveBufferController::new(BufferConfig {
            initial_size: 300,
            min_size: 300,
            max_size: 300,
            ..Default::default()
        });
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();
        assert!(c.on_dropout(&d, t0).is_none());
        for i in 0..5 {
            assert!(c.on_underrun(&d, secs(t0, i)).is_none());
        }
        assert_eq!(c.current_size(&d), Some(300));
    }

    #[test]
    fn test_unknown_device_is_ignored_but_counted() {
        let mut c = controller();
        let d = DeviceId::from("ghost");
        assert!(c.on_dropout(&d, Instant::now()).is_none());
        assert_eq!(c.take_audio_counters().dropouts, 1);
        assert_eq!(c.audio_counters(), AudioCounters::default());
    }

    #[test]
    fn test_set_bounds_clamps_open_devices() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        c.set_bounds(300, 600).unwrap();
        assert_eq!(c.current_size(&d), Some(300));
        assert!(c.set_bounds(700, 600).is_err());
        assert_eq!(c.bounds(), (300, 600));
    }

    #[test]
    fn test_size_always_within_bounds() {
        let mut c = controller();
        let d = DeviceId::from("kitchen");
        c.open(&d);
        let t0 = Instant::now();
        for i in 0..200u64 {
            let now = t0 + Duration::from_millis(i * 1700);
            match i % 4 {
                0 => c.on_dropout(&d, now),
                1 | 2 => c.on_overrun(&d, now),
                _ => c.on_underrun(&d, now),
            };
            let s = c.state(&d).unwrap();
            assert!(s.min_size <= s.current_size && s.current_size <= s.max_size);
        }
    }
}
