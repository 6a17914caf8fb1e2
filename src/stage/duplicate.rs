//! Probabilistic packet fan-out.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{AtomicPercent, DirectionFilter};
use crate::packet::Packet;
use crate::rng::RandomSource;

const MIN_COPIES: u32 = 1;
const MAX_COPIES: u32 = 5;

/// With probability `dup_rate` percent, emits `dup_count` extra deep copies
/// of an in-scope packet. Copies follow their original contiguously, before
/// the next input packet, so fan-out interleaving is well defined.
pub struct DuplicateStage {
    enabled: AtomicBool,
    dup_rate: AtomicPercent,
    dup_count: AtomicU32,
    direction: DirectionFilter,
}

impl Default for DuplicateStage {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateStage {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            dup_rate: AtomicPercent::new(0.0),
            dup_count: AtomicU32::new(MIN_COPIES),
            direction: DirectionFilter::default(),
        }
    }

    pub fn process_batch(&self, batch: Vec<Packet>) -> Vec<Packet> {
        if !self.is_enabled() {
            return batch;
        }

        let mut out = Vec::with_capacity(batch.len() * 2);
        for packet in batch {
            let duplicate = self.direction.admits(&packet.addr) && self.should_duplicate();
            out.push(packet);
            if duplicate {
                let count = self.dup_count.load(Ordering::Relaxed);
                for _ in 0..count {
                    let copy = out.last().expect("original just pushed").clone();
                    out.push(copy);
                }
            }
        }
        out
    }

    fn should_duplicate(&self) -> bool {
        let rate = self.dup_rate.get();
        if rate <= 0.0 {
            return false;
        }
        if rate >= 100.0 {
            return true;
        }
        RandomSource::percentage() < rate
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_dup_rate(&self, percentage: f32) {
        self.dup_rate.set(percentage);
    }

    pub fn dup_rate(&self) -> f32 {
        self.dup_rate.get()
    }

    /// Extra copies per duplicated packet, saturated to `[1, 5]`.
    pub fn set_dup_count(&self, count: u32) {
        self.dup_count
            .store(count.clamp(MIN_COPIES, MAX_COPIES), Ordering::Relaxed);
    }

    pub fn dup_count(&self) -> u32 {
        self.dup_count.load(Ordering::Relaxed)
    }

    pub fn direction(&self) -> &DirectionFilter {
        &self.direction
    }
}
