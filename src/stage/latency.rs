//! Fixed added delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{DelayQueue, DirectionFilter};
use crate::packet::Packet;

/// Delays every in-scope packet by the current `latency_ms`.
///
/// The queue is still ordered by `release_at` rather than FIFO: the delay
/// can change between admissions, and a packet admitted earlier under a
/// larger delay must not block one admitted later under a smaller delay.
pub struct LatencyStage {
    enabled: AtomicBool,
    latency_ms: AtomicU64,
    direction: DirectionFilter,
    queue: Mutex<DelayQueue>,
}

impl Default for LatencyStage {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStage {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            direction: DirectionFilter::default(),
            queue: Mutex::new(DelayQueue::new()),
        }
    }

    pub fn process_batch(&self, batch: Vec<Packet>) -> Vec<Packet> {
        if !self.is_enabled() {
            return batch;
        }

        let delay = Duration::from_millis(self.latency_ms.load(Ordering::Relaxed));
        let now = Instant::now();
        let mut out = Vec::new();
        let mut queue = self.queue.lock();

        for mut packet in batch {
            if self.direction.admits(&packet.addr) {
                packet.release_at = now + delay;
                queue.push(packet);
            } else {
                out.push(packet);
            }
        }

        out
    }

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

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_latency_ms(&self, latency_ms: u64) {
        self.latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn direction(&self) -> &DirectionFilter {
        &self.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::divert::DivertAddress;

    fn tagged(tags: &[u8]) -> Vec<Packet> {
        tags.iter()
            .map(|&t| Packet::new(vec![t], DivertAddress::default(), Instant::now()))
            .collect()
    }

    #[test]
    fn holds_until_deadline() {
        let stage = LatencyStage::new();
        stage.set_enabled(true);
        stage.set_latency_ms(100);

        let admitted = Instant::now();
        let out = stage.process_batch(tagged(&[1]));
        assert!(out.is_empty());

        assert!(stage.drain_due(admitted + Duration::from_millis(50)).is_empty());
        let due = stage.drain_due(admitted + Duration::from_millis(150));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn shrinking_delay_lets_later_packets_overtake() {
        let stage = LatencyStage::new();
        stage.set_enabled(true);

        stage.set_latency_ms(500);
        stage.process_batch(tagged(&[1]));

        stage.set_latency_ms(10);
        stage.process_batch(tagged(&[2]));

        let due = stage.drain_due(Instant::now() + Duration::from_millis(50));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].data[0], 2);

        let rest = stage.drain_due(Instant::now() + Duration::from_millis(600));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].data[0], 1);
    }

    #[test]
    fn same_deadline_releases_in_admission_order() {
        let stage = LatencyStage::new();
        stage.set_enabled(true);
        stage.set_latency_ms(0);
        stage.process_batch(tagged(&[1, 2, 3]));

        let due = stage.drain_due(Instant::now());
        let tags: Vec<u8> = due.iter().map(|p| p.data[0]).collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn disabled_drain_flushes() {
        let stage = LatencyStage::new();
        stage.set_enabled(true);
        stage.set_latency_ms(60_000);
        stage.process_batch(tagged(&[1, 2]));

        stage.set_enabled(false);
        assert_eq!(stage.drain_due(Instant::now()).len(), 2);
        assert_eq!(stage.queue_depth(), 0);
    }
}
