//! Per-packet random delay.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{DelayQueue, DirectionFilter};
use crate::packet::Packet;
use crate::rng::RandomSource;

/// Delays each in-scope packet by a uniform draw from
/// `[min_ms, max_ms]` (inclusive) and releases by ascending `release_at`.
///
/// `min_ms` and `max_ms` are independent atomics, so a concurrent
/// reconfiguration can be observed with `min > max`; the sampler swaps
/// locally before drawing.
pub struct JitterStage {
    enabled: AtomicBool,
    min_ms: AtomicU32,
    max_ms: AtomicU32,
    direction: DirectionFilter,
    queue: Mutex<DelayQueue>,
}

impl Default for JitterStage {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterStage {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            min_ms: AtomicU32::new(0),
            max_ms: AtomicU32::new(0),
            direction: DirectionFilter::default(),
            queue: Mutex::new(DelayQueue::new()),
        }
    }

    pub fn process_batch(&self, batch: Vec<Packet>) -> Vec<Packet> {
        if !self.is_enabled() {
            return batch;
        }

        let now = Instant::now();
        let mut out = Vec::new();
        let mut queue = self.queue.lock();

        for mut packet in batch {
            if self.direction.admits(&packet.addr) {
                packet.release_at = now + Duration::from_millis(self.sample_ms() as u64);
                queue.push(packet);
            } else {
                out.push(packet);
            }
        }

        out
    }

    /// Packets whose release time has arrived; everything queued when the
    /// stage is disabled.
    pub fn drain_due(&self, now: Instant) -> Vec<Packet> {
        let mut queue = self.queue.lock();
        if self.is_enabled() {
            queue.pop_due(now)
        } else {
            queue.drain()
        }
    }

    pub fn drain_all(&self) -> Vec<Packet> {
        self.queue.lock().drain()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn sample_ms(&self) -> u32 {
        let a = self.min_ms.load(Ordering::Relaxed);
        let b = self.max_ms.load(Ordering::Relaxed);
        // A setter racing with this read can leave min above max for one
        // observation; normalize locally.
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        RandomSource::range_inclusive(lo, hi)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Stores the range normalized so `min <= max`, swapping if needed.
    pub fn set_range_ms(&self, min_ms: u32, max_ms: u32) {
        self.min_ms.store(min_ms.min(max_ms), Ordering::Relaxed);
        self.max_ms.store(min_ms.max(max_ms), Ordering::Relaxed);
    }

    pub fn min_ms(&self) -> u32 {
        self.min_ms.load(Ordering::Relaxed)
    }

    pub fn max_ms(&self) -> u32 {
        self.max_ms.load(Ordering::Relaxed)
    }

    pub fn direction(&self) -> &DirectionFilter {
        &self.direction
    }
}
