//! Probabilistic packet drop.

use std::sync::atomic::{AtomicBool, Ordering};

use super::{AtomicPercent, DirectionFilter};
use crate::packet::Packet;
use crate::rng::RandomSource;

/// Drops each in-scope packet with probability `loss_rate` percent. Holds no
/// packets back, so it has no queue and nothing to drain.
pub struct LossStage {
    enabled: AtomicBool,
    loss_rate: AtomicPercent,
    direction: DirectionFilter,
}

impl Default for LossStage {
    fn default() -> Self {
        Self::new()
    }
}

impl LossStage {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            loss_rate: AtomicPercent::new(0.0),
            direction: DirectionFilter::default(),
        }
    }

    pub fn process_batch(&self, batch: Vec<Packet>) -> Vec<Packet> {
        if !self.is_enabled() {
            return batch;
        }
        batch
            .into_iter()
            .filter(|p| !(self.direction.admits(&p.addr) && self.should_drop()))
            .collect()
    }

    fn should_drop(&self) -> bool {
        let rate = self.loss_rate.get();
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

    pub fn set_loss_rate(&self, percentage: f32) {
        self.loss_rate.set(percentage);
    }

    pub fn loss_rate(&self) -> f32 {
        self.loss_rate.get()
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
    use std::time::Instant;

    fn batch(n: usize, outbound: bool) -> Vec<Packet> {
        let addr = DivertAddress {
            outbound,
            ..Default::default()
        };
        (0..n)
            .map(|_| Packet::new(vec![0u8; 64], addr, Instant::now()))
            .collect()
    }

    #[test]
    fn disabled_is_identity() {
        let stage = LossStage::new();
        stage.set_loss_rate(100.0);
        assert_eq!(stage.process_batch(batch(10, false)).len(), 10);
    }

    #[test]
    fn rate_zero_never_drops() {
        let stage = LossStage::new();
        stage.set_enabled(true);
        stage.set_loss_rate(0.0);
        assert_eq!(stage.process_batch(batch(500, false)).len(), 500);
    }

    #[test]
    fn rate_hundred_always_drops() {
        let stage = LossStage::new();
        stage.set_enabled(true);
        stage.set_loss_rate(100.0);
        assert!(stage.process_batch(batch(500, false)).is_empty());
    }

    #[test]
    fn out_of_scope_packets_survive_full_loss() {
        let stage = LossStage::new();
        stage.set_enabled(true);
        stage.set_loss_rate(100.0);
        stage.direction().set_outbound(false);
        assert_eq!(stage.process_batch(batch(50, true)).len(), 50);
        assert!(stage.process_batch(batch(50, false)).is_empty());
    }

    #[test]
    fn drop_count_tracks_rate() {
        // 2000 draws at 30%: mean 600, sd ~20.5. A +/-120 window is almost
        // six standard deviations, comfortably past a 99.9% interval.
        let stage = LossStage::new();
        stage.set_enabled(true);
        stage.set_loss_rate(30.0);
        let survived = stage.process_batch(batch(2000, false)).len();
        let dropped = 2000 - survived;
        assert!(
            (480..=720).contains(&dropped),
            "dropped {} of 2000 at 30%",
            dropped
        );
    }

    proptest! {
        #[test]
        fn rate_setter_clamps(rate in -200.0f32..300.0) {
            let stage = LossStage::new();
            stage.set_loss_rate(rate);
            prop_assert!((0.0..=100.0).contains(&stage.loss_rate()));
        }
    }
}
