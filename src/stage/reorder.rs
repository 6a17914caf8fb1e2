//! Bounded-buffer packet reordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use super::{AtomicPercent, DirectionFilter};
use crate::packet::Packet;
use crate::rng::RandomSource;

const MIN_GAP: u32 = 2;
const MAX_GAP: u32 = 10;

/// Buffers in-scope packets until `gap` of them accumulate, then shuffles
/// the whole buffer when the stochastic trigger fires and releases all but
/// `gap / 2` from the front. The held-back tail mixes with the next batch,
/// which is what produces visible inversions; shuffling the full buffer
/// bounds the maximum displacement to the buffer size.
///
/// Out-of-direction packets bypass the buffer entirely so non-targeted
/// traffic picks up no added latency.
pub struct ReorderStage {
    enabled: AtomicBool,
    reorder_rate: AtomicPercent,
    gap: AtomicU32,
    direction: DirectionFilter,
    buffer: Mutex<VecDeque<Packet>>,
}

impl Default for ReorderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderStage {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            reorder_rate: AtomicPercent::new(0.0),
            gap: AtomicU32::new(MIN_GAP),
            direction: DirectionFilter::default(),
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    pub fn process_batch(&self, batch: Vec<Packet>) -> Vec<Packet> {
        if !self.is_enabled() {
            return batch;
        }

        let mut out = Vec::new();
        let mut buffer = self.buffer.lock();

        for packet in batch {
            if self.direction.admits(&packet.addr) {
                buffer.push_back(packet);
            } else {
                out.push(packet);
            }
        }

        let gap = self.gap.load(Ordering::Relaxed) as usize;
        if buffer.len() >= gap {
            let release = buffer.len() - gap / 2;
            if self.should_reorder() {
                RandomSource::shuffle(buffer.make_contiguous());
            }
            out.extend(buffer.drain(..release));
        }

        out
    }

    /// Unconditionally empty the buffer. Only the shutdown path calls
    /// this; packets stranded by a mid-run disable wait here until then.
    pub fn drain_all(&self) -> Vec<Packet> {
        self.buffer.lock().drain(..).collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.buffer.lock().len()
    }

    fn should_reorder(&self) -> bool {
        let rate = self.reorder_rate.get();
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

    pub fn set_reorder_rate(&self, percentage: f32) {
        self.reorder_rate.set(percentage);
    }

    pub fn reorder_rate(&self) -> f32 {
        self.reorder_rate.get()
    }

    /// Buffer threshold before any release, saturated to `[2, 10]`.
    pub fn set_gap(&self, gap: u32) {
        self.gap.store(gap.clamp(MIN_GAP, MAX_GAP), Ordering::Relaxed);
    }

    pub fn gap(&self) -> u32 {
        self.gap.load(Ordering::Relaxed)
    }

    pub fn direction(&self) -> &DirectionFilter {
        &self.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::divert::DivertAddress;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::time::Instant;

    fn tagged(tags: &[u8]) -> Vec<Packet> {
        tags.iter()
            .map(|&t| Packet::new(vec![t], DivertAddress::default(), Instant::now()))
            .collect()
    }

    #[test]
    fn holds_half_gap_back() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(4);
        stage.set_reorder_rate(100.0);

        let out = stage.process_batch(tagged(&[1, 2, 3, 4]));
        assert_eq!(out.len(), 2);
        assert_eq!(stage.queue_depth(), 2);

        // Released and buffered packets together are exactly the input set.
        let released: BTreeSet<u8> = out.iter().map(|p| p.data[0]).collect();
        let buffered: BTreeSet<u8> = stage.drain_all().iter().map(|p| p.data[0]).collect();
        let all: BTreeSet<u8> = released.union(&buffered).copied().collect();
        assert_eq!(all, BTreeSet::from([1, 2, 3, 4]));
    }

    #[test]
    fn survivors_mix_with_next_batch() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(4);
        stage.set_reorder_rate(100.0);

        let first = stage.process_batch(tagged(&[1, 2, 3, 4]));
        assert_eq!(first.len(), 2);

        // Two survivors plus two new packets reach the gap again.
        let second = stage.process_batch(tagged(&[5, 6]));
        assert_eq!(second.len(), 2);
        assert_eq!(stage.queue_depth(), 2);

        let mut seen: BTreeSet<u8> = first.iter().map(|p| p.data[0]).collect();
        seen.extend(second.iter().map(|p| p.data[0]));
        seen.extend(stage.drain_all().iter().map(|p| p.data[0]));
        assert_eq!(seen, BTreeSet::from([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn below_gap_releases_nothing() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(10);
        assert!(stage.process_batch(tagged(&[1, 2, 3])).is_empty());
        assert_eq!(stage.queue_depth(), 3);
    }

    #[test]
    fn rate_zero_preserves_fifo() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(2);
        stage.set_reorder_rate(0.0);

        let out = stage.process_batch(tagged(&[1, 2, 3, 4, 5]));
        let tags: Vec<u8> = out.iter().map(|p| p.data[0]).collect();
        assert_eq!(tags, vec![1, 2, 3, 4]);
    }

    #[test]
    fn out_of_direction_bypasses_buffer() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(10);
        stage.direction().set_outbound(false);

        let addr = DivertAddress {
            outbound: true,
            ..Default::default()
        };
        let batch = vec![Packet::new(vec![7], addr, Instant::now())];
        let out = stage.process_batch(batch);
        assert_eq!(out.len(), 1);
        assert_eq!(stage.queue_depth(), 0);
    }

    #[test]
    fn disable_leaves_buffer_for_drain_all() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(10);
        stage.process_batch(tagged(&[1, 2, 3]));

        // A mid-run disable strands the buffered packets; only drain_all
        // (the shutdown sweep) takes them out.
        stage.set_enabled(false);
        assert_eq!(stage.queue_depth(), 3);
        assert_eq!(stage.drain_all().len(), 3);
        assert_eq!(stage.queue_depth(), 0);
    }

    proptest! {
        #[test]
        fn gap_saturates(gap in 0u32..100) {
            let stage = ReorderStage::new();
            stage.set_gap(gap);
            prop_assert!((2..=10).contains(&stage.gap()));
        }
    }
}
