//! Engine statistics.
//!
//! All counters are monotonically increasing atomics bumped with relaxed
//! adds from the hot paths; derived values are computed on read. Counters
//! reset to zero when a capture starts.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub packets_captured: u64,
    pub bytes_captured: u64,
    pub packets_injected: u64,
    /// Monitoring-ring entries evicted because the ring was full.
    pub packets_dropped_info: u64,
    pub send_failures: u64,
    pub batch_count: u64,
    /// Mean packets per received batch; zero before the first batch.
    pub avg_batch_size: f64,
}

pub struct EngineStats {
    packets_captured: AtomicU64,
    bytes_captured: AtomicU64,
    packets_injected: AtomicU64,
    packets_dropped_info: AtomicU64,
    send_failures: AtomicU64,
    batch_count: AtomicU64,
    total_batch_packets: AtomicU64,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            packets_captured: AtomicU64::new(0),
            bytes_captured: AtomicU64::new(0),
            packets_injected: AtomicU64::new(0),
            packets_dropped_info: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            batch_count: AtomicU64::new(0),
            total_batch_packets: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        self.packets_captured.store(0, Ordering::SeqCst);
        self.bytes_captured.store(0, Ordering::SeqCst);
        self.packets_injected.store(0, Ordering::SeqCst);
        self.packets_dropped_info.store(0, Ordering::SeqCst);
        self.send_failures.store(0, Ordering::SeqCst);
        self.batch_count.store(0, Ordering::SeqCst);
        self.total_batch_packets.store(0, Ordering::SeqCst);
    }

    /// One packet pulled off the driver.
    #[inline]
    pub fn record_captured(&self, bytes: u64) {
        self.packets_captured.fetch_add(1, Ordering::Relaxed);
        self.bytes_captured.fetch_add(bytes, Ordering::Relaxed);
    }

    /// One batched receive completed with `packets` packets.
    #[inline]
    pub fn record_batch(&self, packets: u64) {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        self.total_batch_packets.fetch_add(packets, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_injected(&self, packets: u64) {
        self.packets_injected.fetch_add(packets, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_info_dropped(&self, evicted: u64) {
        if evicted > 0 {
            self.packets_dropped_info.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_captured(&self) -> u64 {
        self.packets_captured.load(Ordering::Relaxed)
    }

    pub fn packets_injected(&self) -> u64 {
        self.packets_injected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let batches = self.batch_count.load(Ordering::Relaxed);
        let total = self.total_batch_packets.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            packets_injected: self.packets_injected.load(Ordering::Relaxed),
            packets_dropped_info: self.packets_dropped_info.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            batch_count: batches,
            avg_batch_size: if batches > 0 {
                total as f64 / batches as f64
            } else {
                0.0
            },
        }
    }
}
