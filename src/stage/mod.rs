//! The impairment stages and their composition.
//!
//! Each stage owns its configuration as individual atomics read by the
//! capture workers while the control plane mutates them; queued packets sit
//! behind a short per-stage mutex. The six kinds are a closed set: the
//! [`Stage`] enum dispatches by match and the [`Pipeline`] holds one of each
//! in a fixed order that is not user-configurable.

mod bandwidth;
mod duplicate;
mod jitter;
mod latency;
mod loss;
mod reorder;

pub use bandwidth::BandwidthStage;
pub use duplicate::DuplicateStage;
pub use jitter::JitterStage;
pub use latency::LatencyStage;
pub use loss::LossStage;
pub use reorder::ReorderStage;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as MemOrdering};
use std::time::Instant;

use crate::divert::DivertAddress;
use crate::packet::Packet;

/// Direction gate shared by every stage: a packet is eligible for
/// impairment only when its direction bit is switched on.
#[derive(Debug)]
pub struct DirectionFilter {
    inbound: AtomicBool,
    outbound: AtomicBool,
}

impl Default for DirectionFilter {
    fn default() -> Self {
        Self {
            inbound: AtomicBool::new(true),
            outbound: AtomicBool::new(true),
        }
    }
}

impl DirectionFilter {
    /// Whether the stage may touch a packet with this address.
    #[inline]
    pub fn admits(&self, addr: &DivertAddress) -> bool {
        if addr.outbound {
            self.outbound.load(MemOrdering::Relaxed)
        } else {
            self.inbound.load(MemOrdering::Relaxed)
        }
    }

    pub fn set_inbound(&self, enabled: bool) {
        self.inbound.store(enabled, MemOrdering::Relaxed);
    }

    pub fn set_outbound(&self, enabled: bool) {
        self.outbound.store(enabled, MemOrdering::Relaxed);
    }

    pub fn inbound(&self) -> bool {
        self.inbound.load(MemOrdering::Relaxed)
    }

    pub fn outbound(&self) -> bool {
        self.outbound.load(MemOrdering::Relaxed)
    }
}

/// Percentage rate in `[0, 100]` stored as `f32` bits in an atomic, so the
/// hot path reads it without a lock. Stores clamp to the valid range.
#[derive(Debug)]
pub(crate) struct AtomicPercent(AtomicU32);

impl AtomicPercent {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.clamp(0.0, 100.0).to_bits()))
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(MemOrdering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0
            .store(value.clamp(0.0, 100.0).to_bits(), MemOrdering::Relaxed);
    }
}

struct Delayed {
    release_at: Instant,
    seq: u64,
    packet: Packet,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the std max-heap pops the earliest release time; the
    // insertion counter keeps release order stable within a tick.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .release_at
            .cmp(&self.release_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of delayed packets keyed by `release_at`, ties broken by
/// insertion order. Backs the jitter and latency stages.
pub(crate) struct DelayQueue {
    heap: BinaryHeap<Delayed>,
    next_seq: u64,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Queue a packet for release at its `release_at`.
    pub fn push(&mut self, packet: Packet) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Delayed {
            release_at: packet.release_at,
            seq,
            packet,
        });
    }

    /// Pop every packet scheduled at or before `now`, in release order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();
        while self.heap.peek().is_some_and(|head| head.release_at <= now) {
            if let Some(delayed) = self.heap.pop() {
                out.push(delayed.packet);
            }
        }
        out
    }

    /// Unconditionally empty the queue, earliest schedule first.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(d) = self.heap.pop() {
            out.push(d.packet);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

/// One impairment in the pipeline. The set of kinds is closed; dispatch is
/// a match, not a vtable.
pub enum Stage {
    Loss(LossStage),
    Duplicate(DuplicateStage),
    Reorder(ReorderStage),
    Jitter(JitterStage),
    Bandwidth(BandwidthStage),
    Latency(LatencyStage),
}

impl Stage {
    /// Run a batch through the stage, returning the packets to forward now.
    /// A disabled stage is the identity. Packets outside the stage's
    /// direction scope pass through untouched.
    pub fn process_batch(&self, batch: Vec<Packet>) -> Vec<Packet> {
        match self {
            Stage::Loss(s) => s.process_batch(batch),
            Stage::Duplicate(s) => s.process_batch(batch),
            Stage::Reorder(s) => s.process_batch(batch),
            Stage::Jitter(s) => s.process_batch(batch),
            Stage::Bandwidth(s) => s.process_batch(batch),
            Stage::Latency(s) => s.process_batch(batch),
        }
    }

    /// Packets whose internal schedule is satisfied at `now`. For the
    /// delay-capable stages a disable flushes everything still queued so
    /// nothing is stranded; the other stages have no release thread and
    /// return nothing here (reorder's buffer is only emptied by
    /// `drain_all` at shutdown).
    pub fn drain_due(&self, now: Instant) -> Vec<Packet> {
        match self {
            Stage::Loss(_) | Stage::Duplicate(_) | Stage::Reorder(_) => Vec::new(),
            Stage::Jitter(s) => s.drain_due(now),
            Stage::Bandwidth(s) => s.drain_due(now),
            Stage::Latency(s) => s.drain_due(now),
        }
    }

    /// Unconditionally return and clear all queued packets.
    pub fn drain_all(&self) -> Vec<Packet> {
        match self {
            Stage::Loss(_) | Stage::Duplicate(_) => Vec::new(),
            Stage::Reorder(s) => s.drain_all(),
            Stage::Jitter(s) => s.drain_all(),
            Stage::Bandwidth(s) => s.drain_all(),
            Stage::Latency(s) => s.drain_all(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Stage::Loss(s) => s.is_enabled(),
            Stage::Duplicate(s) => s.is_enabled(),
            Stage::Reorder(s) => s.is_enabled(),
            Stage::Jitter(s) => s.is_enabled(),
            Stage::Bandwidth(s) => s.is_enabled(),
            Stage::Latency(s) => s.is_enabled(),
        }
    }

    /// Packets currently held inside the stage.
    pub fn queue_depth(&self) -> usize {
        match self {
            Stage::Loss(_) | Stage::Duplicate(_) => 0,
            Stage::Reorder(s) => s.queue_depth(),
            Stage::Jitter(s) => s.queue_depth(),
            Stage::Bandwidth(s) => s.queue_depth(),
            Stage::Latency(s) => s.queue_depth(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Loss(_) => "loss",
            Stage::Duplicate(_) => "duplicate",
            Stage::Reorder(_) => "reorder",
            Stage::Jitter(_) => "jitter",
            Stage::Bandwidth(_) => "bandwidth",
            Stage::Latency(_) => "latency",
        }
    }
}

const LOSS: usize = 0;
const DUPLICATE: usize = 1;
const REORDER: usize = 2;
const JITTER: usize = 3;
const BANDWIDTH: usize = 4;
const LATENCY: usize = 5;

/// The six stages in their fixed processing order:
/// loss, duplicate, reorder, jitter, bandwidth, latency.
///
/// Loss runs first so dropped packets never cost downstream work; duplicate
/// precedes reorder so copies can be shuffled together; bandwidth follows
/// jitter so jittered packets do not spend tokens while delayed; latency
/// runs last to keep its queue depth independent of the stochastic stages.
pub struct Pipeline {
    stages: [Stage; 6],
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: [
                Stage::Loss(LossStage::new()),
                Stage::Duplicate(DuplicateStage::new()),
                Stage::Reorder(ReorderStage::new()),
                Stage::Jitter(JitterStage::new()),
                Stage::Bandwidth(BandwidthStage::new()),
                Stage::Latency(LatencyStage::new()),
            ],
        }
    }

    /// Run a batch through every enabled stage in order.
    pub fn process(&self, mut batch: Vec<Packet>) -> Vec<Packet> {
        for stage in &self.stages {
            if batch.is_empty() {
                break;
            }
            if stage.is_enabled() {
                batch = stage.process_batch(batch);
            }
        }
        batch
    }

    pub fn stages(&self) -> &[Stage; 6] {
        &self.stages
    }

    /// Total packets currently queued across all stages.
    pub fn queue_depth(&self) -> usize {
        self.stages.iter().map(Stage::queue_depth).sum()
    }

    pub fn loss(&self) -> &LossStage {
        match &self.stages[LOSS] {
            Stage::Loss(s) => s,
            _ => unreachable!("pipeline order is fixed"),
        }
    }

    pub fn duplicate(&self) -> &DuplicateStage {
        match &self.stages[DUPLICATE] {
            Stage::Duplicate(s) => s,
            _ => unreachable!("pipeline order is fixed"),
        }
    }

    pub fn reorder(&self) -> &ReorderStage {
        match &self.stages[REORDER] {
            Stage::Reorder(s) => s,
            _ => unreachable!("pipeline order is fixed"),
        }
    }

    pub fn jitter(&self) -> &JitterStage {
        match &self.stages[JITTER] {
            Stage::Jitter(s) => s,
            _ => unreachable!("pipeline order is fixed"),
        }
    }

    pub fn bandwidth(&self) -> &BandwidthStage {
        match &self.stages[BANDWIDTH] {
            Stage::Bandwidth(s) => s,
            _ => unreachable!("pipeline order is fixed"),
        }
    }

    pub fn latency(&self) -> &LatencyStage {
        match &self.stages[LATENCY] {
            Stage::Latency(s) => s,
            _ => unreachable!("pipeline order is fixed"),
        }
    }

    /// The delay-capable stages, each of which gets a release thread.
    pub fn delay_stages(&self) -> [&Stage; 3] {
        [
            &self.stages[JITTER],
            &self.stages[BANDWIDTH],
            &self.stages[LATENCY],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::divert::DivertAddress;
    use std::time::Duration;

    fn packet(release_in: Duration) -> Packet {
        let now = Instant::now();
        let mut p = Packet::new(vec![0u8; 8], DivertAddress::default(), now);
        p.release_at = now + release_in;
        p
    }

    #[test]
    fn delay_queue_pops_in_release_order() {
        let mut q = DelayQueue::new();
        q.push(packet(Duration::from_millis(30)));
        q.push(packet(Duration::from_millis(10)));
        q.push(packet(Duration::from_millis(20)));

        let due = q.pop_due(Instant::now() + Duration::from_millis(60));
        assert_eq!(due.len(), 3);
        assert!(due[0].release_at <= due[1].release_at);
        assert!(due[1].release_at <= due[2].release_at);
    }

    #[test]
    fn delay_queue_ties_release_in_insertion_order() {
        let now = Instant::now();
        let at = now + Duration::from_millis(5);
        let mut q = DelayQueue::new();
        for tag in 0u8..4 {
            let mut p = Packet::new(vec![tag], DivertAddress::default(), now);
            p.release_at = at;
            q.push(p);
        }
        let due = q.pop_due(at);
        let tags: Vec<u8> = due.iter().map(|p| p.data[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
    }

    #[test]
    fn delay_queue_holds_future_packets() {
        let mut q = DelayQueue::new();
        q.push(packet(Duration::from_secs(60)));
        assert!(q.pop_due(Instant::now()).is_empty());
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain().len(), 1);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn direction_filter_defaults_open() {
        let f = DirectionFilter::default();
        assert!(f.admits(&DivertAddress::default()));
        let out = DivertAddress {
            outbound: true,
            ..Default::default()
        };
        assert!(f.admits(&out));
        f.set_outbound(false);
        assert!(!f.admits(&out));
        assert!(f.admits(&DivertAddress::default()));
    }

    #[test]
    fn atomic_percent_clamps() {
        let p = AtomicPercent::new(150.0);
        assert_eq!(p.get(), 100.0);
        p.set(-3.0);
        assert_eq!(p.get(), 0.0);
        p.set(42.5);
        assert_eq!(p.get(), 42.5);
    }

    #[test]
    fn pipeline_identity_when_all_disabled() {
        let pipeline = Pipeline::new();
        let now = Instant::now();
        let batch: Vec<Packet> = (0u8..5)
            .map(|i| Packet::new(vec![i; 16], DivertAddress::default(), now))
            .collect();
        let out = pipeline.process(batch);
        assert_eq!(out.len(), 5);
        for (i, p) in out.iter().enumerate() {
            assert_eq!(p.data[0], i as u8);
        }
        assert_eq!(pipeline.queue_depth(), 0);
    }
}
