//! Token-bucket bandwidth cap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use super::DirectionFilter;
use crate::packet::Packet;

struct Bucket {
    /// Available bytes. Floating point: at low rates, integer token math
    /// rounds refills to zero across 10 ms polls and the output stutters.
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Packet>,
}

/// Byte-per-second rate limiter. The bucket holds one second of burst
/// (`kbps * 1000 / 8` bytes); admission is strictly FIFO and stops at the
/// first packet that does not fit, so ordering is preserved under pressure.
pub struct BandwidthStage {
    enabled: AtomicBool,
    kbps: AtomicU32,
    direction: DirectionFilter,
    bucket: Mutex<Bucket>,
}

impl Default for BandwidthStage {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthStage {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            kbps: AtomicU32::new(1000),
            direction: DirectionFilter::default(),
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
                queue: VecDeque::new(),
            }),
        }
    }

    /// One second of burst at the configured rate, in bytes.
    #[inline]
    fn capacity(&self) -> f64 {
        self.kbps.load(Ordering::Relaxed) as f64 * 1000.0 / 8.0
    }

    pub fn process_batch(&self, batch: Vec<Packet>) -> Vec<Packet> {
        if !self.is_enabled() {
            return batch;
        }

        let mut out = Vec::new();
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        for packet in batch {
            if self.direction.admits(&packet.addr) {
                bucket.queue.push_back(packet);
            } else {
                out.push(packet);
            }
        }

        self.admit(&mut bucket, &mut out);
        out
    }

    /// Refill then admit whatever now fits; the whole queue when disabled.
    pub fn drain_due(&self, _now: Instant) -> Vec<Packet> {
        let mut bucket = self.bucket.lock();
        if !self.is_enabled() {
            return bucket.queue.drain(..).collect();
        }

        self.refill(&mut bucket);
        let mut out = Vec::new();
        self.admit(&mut bucket, &mut out);
        out
    }

    pub fn drain_all(&self) -> Vec<Packet> {
        self.bucket.lock().queue.drain(..).collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.bucket.lock().queue.len()
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let capacity = self.capacity();
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        bucket.last_refill = now;
    }

    fn admit(&self, bucket: &mut Bucket, out: &mut Vec<Packet>) {
        while let Some(front) = bucket.queue.front() {
            let size = front.len() as f64;
            if bucket.tokens < size {
                break;
            }
            bucket.tokens -= size;
            out.push(bucket.queue.pop_front().expect("front exists"));
        }
    }

    /// Enabling seeds the bucket at half capacity so a long-idle stage does
    /// not start with a full second of burst.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if enabled {
            let mut bucket = self.bucket.lock();
            bucket.last_refill = Instant::now();
            bucket.tokens = self.capacity() / 2.0;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Changing the rate recomputes capacity immediately; tokens above the
    /// new capacity are clamped by the next refill.
    pub fn set_kbps(&self, kbps: u32) {
        self.kbps.store(kbps, Ordering::Relaxed);
    }

    pub fn kbps(&self) -> u32 {
        self.kbps.load(Ordering::Relaxed)
    }

    pub fn direction(&self) -> &DirectionFilter {
        &self.direction
    }
}
