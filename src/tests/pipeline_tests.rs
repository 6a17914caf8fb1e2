//! Cross-stage composition and accounting properties.

use std::time::{Duration, Instant};

use super::fake_divert::{inbound_addr, outbound_addr, udp_packet, MemDivert};
use crate::config::CaptureParams;
use crate::divert::DivertAddress;
use crate::engine::FaultEngine;
use crate::packet::Packet;
use crate::stage::Pipeline;

fn test_params() -> CaptureParams {
    CaptureParams {
        worker_threads: 1,
        batch_size: 4,
        ..Default::default()
    }
}

fn batch(n: usize, addr: DivertAddress) -> Vec<Packet> {
    (0..n)
        .map(|i| Packet::new(udp_packet(64, i as u8), addr, Instant::now()))
        .collect()
}

#[test]
fn packets_in_equal_packets_out_plus_queued() {
    let pipeline = Pipeline::new();
    pipeline.reorder().set_enabled(true);
    pipeline.reorder().set_gap(10);
    pipeline.jitter().set_enabled(true);
    pipeline.jitter().set_range_ms(60_000, 60_000);

    let out = pipeline.process(batch(6, inbound_addr()));
    assert_eq!(out.len() + pipeline.queue_depth(), 6);
    // Below the reorder gap, everything is still in the reorder buffer and
    // the jitter stage saw nothing.
    assert!(out.is_empty());
    assert_eq!(pipeline.reorder().queue_depth(), 6);
    assert_eq!(pipeline.jitter().queue_depth(), 0);
}

#[test]
fn loss_runs_before_fanout() {
    // Order is part of the contract: a dropped packet must never spawn
    // duplicates downstream.
    let pipeline = Pipeline::new();
    pipeline.loss().set_enabled(true);
    pipeline.loss().set_loss_rate(100.0);
    pipeline.duplicate().set_enabled(true);
    pipeline.duplicate().set_dup_rate(100.0);
    pipeline.duplicate().set_dup_count(5);

    let out = pipeline.process(batch(10, inbound_addr()));
    assert!(out.is_empty());
    assert_eq!(pipeline.queue_depth(), 0);
}

#[test]
fn fanout_multiplies_through_the_chain() {
    let pipeline = Pipeline::new();
    pipeline.duplicate().set_enabled(true);
    pipeline.duplicate().set_dup_rate(100.0);
    pipeline.duplicate().set_dup_count(2);

    let out = pipeline.process(batch(3, inbound_addr()));
    assert_eq!(out.len(), 9);
}

#[test]
fn direction_gate_bypasses_impairment_end_to_end() {
    let (divert, net) = MemDivert::new();
    let mut engine = FaultEngine::new(divert);
    engine.set_loss_rate(100.0);
    engine.set_loss_outbound(false);
    engine.set_loss_enabled(true);
    engine.start("true", test_params()).expect("start");

    // Outbound traffic is out of scope for the loss stage and must pass
    // unmodified; inbound traffic is eaten.
    net.inject_many((0..20).map(|i| (udp_packet(64, i as u8), outbound_addr())));
    assert!(net.wait_for_sent(20, Duration::from_secs(5)));

    net.inject_many((0..20).map(|i| (udp_packet(64, i as u8), inbound_addr())));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(net.sent_count(), 20);

    let stats = engine.stats();
    assert_eq!(stats.packets_captured, 40);
    assert_eq!(stats.packets_injected, 20);
    engine.stop();
}

#[test]
fn captured_covers_injected_while_running() {
    let (divert, net) = MemDivert::new();
    let mut engine = FaultEngine::new(divert);
    engine.set_latency_ms(300);
    engine.set_latency_enabled(true);
    engine.start("true", test_params()).expect("start");

    net.inject_many((0..30).map(|i| (udp_packet(64, i as u8), inbound_addr())));
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        let stats = engine.stats();
        assert!(
            stats.packets_captured >= stats.packets_injected,
            "captured {} < injected {}",
            stats.packets_captured,
            stats.packets_injected
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(net.wait_for_sent(30, Duration::from_secs(2)));
    engine.stop();
}

#[test]
fn resetting_a_setting_to_its_value_changes_nothing() {
    let pipeline = Pipeline::new();
    pipeline.reorder().set_gap(6);
    pipeline.reorder().set_gap(pipeline.reorder().gap());
    assert_eq!(pipeline.reorder().gap(), 6);

    pipeline.loss().set_loss_rate(12.5);
    pipeline.loss().set_loss_rate(pipeline.loss().loss_rate());
    assert_eq!(pipeline.loss().loss_rate(), 12.5);

    pipeline.jitter().set_range_ms(10, 20);
    pipeline
        .jitter()
        .set_range_ms(pipeline.jitter().min_ms(), pipeline.jitter().max_ms());
    assert_eq!((pipeline.jitter().min_ms(), pipeline.jitter().max_ms()), (10, 20));
}
