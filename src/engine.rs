//! The impairment engine: capture workers, release threads, statistics and
//! the control API.
//!
//! Lifecycle is `Idle -> Running -> Stopping -> Idle`. Between `start` and
//! `stop` the diverter handle is immutable and shared by every worker and
//! release thread; the driver serializes concurrent batched calls. Shutdown
//! is cooperative: a stop flag checked on every loop iteration plus a
//! receive-side shutdown to unblock workers parked in the driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CaptureParams;
use crate::divert::{
    DivertAddress, DivertDriver, DivertHandle, DivertOpenError, DivertParam, DivertRecvError,
};
use crate::packet::Packet;
use crate::parser::{PacketInfo, PacketParser};
use crate::ring::MonitorRing;
use crate::stage::{
    BandwidthStage, DuplicateStage, JitterStage, LatencyStage, LossStage, Pipeline, ReorderStage,
    Stage,
};
use crate::stats::{EngineStats, StatsSnapshot};

/// Poll interval of the release threads. Worst-case added scheduling
/// granularity for any delayed packet, and the visible tail-latency floor.
pub const RELEASE_POLL: Duration = Duration::from_millis(10);

/// Grace period for workers to drain in-flight batches before joining.
const STOP_GRACE: Duration = Duration::from_millis(250);

/// Failures of the only fallible lifecycle operation, `start`. Runtime
/// receive/send errors are recorded in `last_error` instead of propagating.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("capture is already running")]
    AlreadyRunning,
    #[error(transparent)]
    DriverOpen(#[from] DivertOpenError),
    #[error("driver rejected parameter {0:?}")]
    DriverParam(DivertParam),
}

/// Driver version as reported through the parameter interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: u64,
    pub minor: u64,
}

/// State shared with worker and release threads.
struct Shared<H: DivertHandle> {
    /// Open handle; `Some` exactly while capturing.
    handle: RwLock<Option<Arc<H>>>,
    pipeline: Pipeline,
    stats: EngineStats,
    ring: MonitorRing,
    params: Mutex<CaptureParams>,
    last_error: Mutex<Option<String>>,
    should_stop: AtomicBool,
    is_capturing: AtomicBool,
}

impl<H: DivertHandle> Shared<H> {
    fn set_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    fn current_handle(&self) -> Option<Arc<H>> {
        self.handle.read().clone()
    }
}

/// The three delay-capable stages, each of which owns a release thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelaySlot {
    Jitter,
    Bandwidth,
    Latency,
}

impl DelaySlot {
    const ALL: [DelaySlot; 3] = [DelaySlot::Jitter, DelaySlot::Bandwidth, DelaySlot::Latency];

    fn stage(self, pipeline: &Pipeline) -> &Stage {
        let [jitter, bandwidth, latency] = pipeline.delay_stages();
        match self {
            DelaySlot::Jitter => jitter,
            DelaySlot::Bandwidth => bandwidth,
            DelaySlot::Latency => latency,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DelaySlot::Jitter => "jitter",
            DelaySlot::Bandwidth => "bandwidth",
            DelaySlot::Latency => "latency",
        }
    }
}

#[derive(Default)]
struct ReleaseThreads {
    jitter: Option<JoinHandle<()>>,
    bandwidth: Option<JoinHandle<()>>,
    latency: Option<JoinHandle<()>>,
}

impl ReleaseThreads {
    fn slot_mut(&mut self, slot: DelaySlot) -> &mut Option<JoinHandle<()>> {
        match slot {
            DelaySlot::Jitter => &mut self.jitter,
            DelaySlot::Bandwidth => &mut self.bandwidth,
            DelaySlot::Latency => &mut self.latency,
        }
    }

    fn take_all(&mut self) -> Vec<JoinHandle<()>> {
        [
            self.jitter.take(),
            self.bandwidth.take(),
            self.latency.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// User-space network impairment engine over a packet diverter.
pub struct FaultEngine<D: DivertDriver> {
    driver: D,
    shared: Arc<Shared<D::Handle>>,
    workers: Vec<JoinHandle<()>>,
    release: Mutex<ReleaseThreads>,
}

impl<D: DivertDriver> FaultEngine<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            shared: Arc::new(Shared {
                handle: RwLock::new(None),
                pipeline: Pipeline::new(),
                stats: EngineStats::new(),
                ring: MonitorRing::new(CaptureParams::default().ring_capacity),
                params: Mutex::new(CaptureParams::default()),
                last_error: Mutex::new(None),
                should_stop: AtomicBool::new(false),
                is_capturing: AtomicBool::new(false),
            }),
            workers: Vec::new(),
            release: Mutex::new(ReleaseThreads::default()),
        }
    }

    /// Open the diverter with `filter`, apply driver queue parameters,
    /// reset statistics and spawn the worker and release threads.
    ///
    /// Valid only while idle. On any failure every partially acquired
    /// resource is released before returning.
    pub fn start(&mut self, filter: &str, params: CaptureParams) -> Result<(), EngineError> {
        if self.shared.is_capturing.load(Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let handle = self.driver.open(filter)?;

        for (param, value) in [
            (DivertParam::QueueLength, params.queue_length),
            (DivertParam::QueueTime, params.queue_time),
            (DivertParam::QueueSize, params.queue_size),
        ] {
            if !handle.set_param(param, value) {
                handle.close();
                return Err(EngineError::DriverParam(param));
            }
        }

        self.shared.stats.reset();
        self.shared.ring.set_capacity(params.ring_capacity);
        *self.shared.last_error.lock() = None;
        *self.shared.params.lock() = params.clone();
        self.shared.should_stop.store(false, Ordering::SeqCst);

        let handle = Arc::new(handle);
        *self.shared.handle.write() = Some(Arc::clone(&handle));
        self.shared.is_capturing.store(true, Ordering::SeqCst);

        info!(
            filter,
            workers = params.worker_threads,
            batch_size = params.batch_size,
            "capture started"
        );

        self.workers.reserve(params.worker_threads as usize);
        for id in 0..params.worker_threads {
            let shared = Arc::clone(&self.shared);
            let handle = Arc::clone(&handle);
            let worker = thread::Builder::new()
                .name(format!("netfault-worker-{id}"))
                .spawn(move || worker_loop(&shared, &handle))
                .expect("failed to spawn capture worker");
            self.workers.push(worker);
        }

        let mut release = self.release.lock();
        for slot in DelaySlot::ALL {
            if slot.stage(&self.shared.pipeline).is_enabled() {
                *release.slot_mut(slot) = Some(self.spawn_release(slot));
            }
        }

        Ok(())
    }

    /// Stop capturing: unblock and join every thread, close the handle and
    /// discard whatever the delay stages still held. Idempotent.
    pub fn stop(&mut self) {
        if !self.shared.is_capturing.load(Ordering::SeqCst) {
            return;
        }

        self.shared.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.shared.current_handle() {
            handle.shutdown_recv();
        }

        // Let workers finish the batch they are in before joining.
        thread::sleep(STOP_GRACE);

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        for release in self.release.lock().take_all() {
            let _ = release.join();
        }

        if let Some(handle) = self.shared.handle.write().take() {
            handle.close();
        }

        // Packets still queued in any stage are dropped, not injected.
        let mut stranded = 0;
        for stage in self.shared.pipeline.stages() {
            stranded += stage.drain_all().len();
        }
        if stranded > 0 {
            debug!(stranded, "discarded queued packets at shutdown");
        }

        self.shared.is_capturing.store(false, Ordering::SeqCst);
        info!("capture stopped");
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.is_capturing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Drain the monitoring ring, oldest record first.
    pub fn fetch_and_clear_monitoring(&self) -> Vec<PacketInfo> {
        self.shared.ring.fetch_and_clear()
    }

    /// Driver version via the parameter interface; zeros when idle.
    pub fn driver_version(&self) -> DriverVersion {
        match self.shared.current_handle() {
            Some(handle) => DriverVersion {
                major: handle.get_param(DivertParam::VersionMajor).unwrap_or(0),
                minor: handle.get_param(DivertParam::VersionMinor).unwrap_or(0),
            },
            None => DriverVersion::default(),
        }
    }

    pub fn params(&self) -> CaptureParams {
        self.shared.params.lock().clone()
    }

    /// Adjust a driver queue parameter at runtime. The stored parameters
    /// are only updated when the driver accepts the change.
    pub fn set_queue_length(&self, length: u64) -> bool {
        self.set_driver_param(DivertParam::QueueLength, length)
    }

    pub fn set_queue_time(&self, time_ms: u64) -> bool {
        self.set_driver_param(DivertParam::QueueTime, time_ms)
    }

    pub fn set_queue_size(&self, size: u64) -> bool {
        self.set_driver_param(DivertParam::QueueSize, size)
    }

    fn set_driver_param(&self, param: DivertParam, value: u64) -> bool {
        let Some(handle) = self.shared.current_handle() else {
            return false;
        };
        if !handle.set_param(param, value) {
            warn!(?param, value, "driver rejected parameter change");
            return false;
        }
        let mut params = self.shared.params.lock();
        match param {
            DivertParam::QueueLength => params.queue_length = value,
            DivertParam::QueueTime => params.queue_time = value,
            DivertParam::QueueSize => params.queue_size = value,
            DivertParam::VersionMajor | DivertParam::VersionMinor => {}
        }
        true
    }

    /// Re-bound the monitoring ring; overflow evictions count as dropped
    /// info records.
    pub fn set_ring_capacity(&self, capacity: usize) {
        let evicted = self.shared.ring.set_capacity(capacity);
        self.shared.stats.record_info_dropped(evicted);
        self.shared.params.lock().ring_capacity = capacity;
    }

    // Loss controls.

    pub fn set_loss_enabled(&self, enabled: bool) {
        self.loss().set_enabled(enabled);
    }

    pub fn is_loss_enabled(&self) -> bool {
        self.loss().is_enabled()
    }

    pub fn set_loss_rate(&self, percentage: f32) {
        self.loss().set_loss_rate(percentage);
    }

    pub fn loss_rate(&self) -> f32 {
        self.loss().loss_rate()
    }

    pub fn set_loss_inbound(&self, enabled: bool) {
        self.loss().direction().set_inbound(enabled);
    }

    pub fn set_loss_outbound(&self, enabled: bool) {
        self.loss().direction().set_outbound(enabled);
    }

    pub fn loss_inbound(&self) -> bool {
        self.loss().direction().inbound()
    }

    pub fn loss_outbound(&self) -> bool {
        self.loss().direction().outbound()
    }

    // Duplicate controls.

    pub fn set_duplicate_enabled(&self, enabled: bool) {
        self.duplicate().set_enabled(enabled);
    }

    pub fn is_duplicate_enabled(&self) -> bool {
        self.duplicate().is_enabled()
    }

    pub fn set_duplicate_rate(&self, percentage: f32) {
        self.duplicate().set_dup_rate(percentage);
    }

    pub fn duplicate_rate(&self) -> f32 {
        self.duplicate().dup_rate()
    }

    pub fn set_duplicate_count(&self, count: u32) {
        self.duplicate().set_dup_count(count);
    }

    pub fn duplicate_count(&self) -> u32 {
        self.duplicate().dup_count()
    }

    pub fn set_duplicate_inbound(&self, enabled: bool) {
        self.duplicate().direction().set_inbound(enabled);
    }

    pub fn set_duplicate_outbound(&self, enabled: bool) {
        self.duplicate().direction().set_outbound(enabled);
    }

    // Reorder controls.

    /// Packets buffered at the time of a disable stay in the buffer; they
    /// are discarded by `stop`'s drain sweep, never injected out of band.
    pub fn set_reorder_enabled(&self, enabled: bool) {
        self.reorder().set_enabled(enabled);
    }

    pub fn is_reorder_enabled(&self) -> bool {
        self.reorder().is_enabled()
    }

    pub fn set_reorder_rate(&self, percentage: f32) {
        self.reorder().set_reorder_rate(percentage);
    }

    pub fn reorder_rate(&self) -> f32 {
        self.reorder().reorder_rate()
    }

    pub fn set_reorder_gap(&self, gap: u32) {
        self.reorder().set_gap(gap);
    }

    pub fn reorder_gap(&self) -> u32 {
        self.reorder().gap()
    }

    pub fn set_reorder_inbound(&self, enabled: bool) {
        self.reorder().direction().set_inbound(enabled);
    }

    pub fn set_reorder_outbound(&self, enabled: bool) {
        self.reorder().direction().set_outbound(enabled);
    }

    // Jitter controls.

    /// Enabling while running spawns the release thread if it is not
    /// already up; disabling never tears it down (it exits on `stop`).
    pub fn set_jitter_enabled(&self, enabled: bool) {
        self.jitter().set_enabled(enabled);
        if enabled {
            self.ensure_release_thread(DelaySlot::Jitter);
        }
    }

    pub fn is_jitter_enabled(&self) -> bool {
        self.jitter().is_enabled()
    }

    pub fn set_jitter_range_ms(&self, min_ms: u32, max_ms: u32) {
        self.jitter().set_range_ms(min_ms, max_ms);
    }

    pub fn jitter_min_ms(&self) -> u32 {
        self.jitter().min_ms()
    }

    pub fn jitter_max_ms(&self) -> u32 {
        self.jitter().max_ms()
    }

    pub fn set_jitter_inbound(&self, enabled: bool) {
        self.jitter().direction().set_inbound(enabled);
    }

    pub fn set_jitter_outbound(&self, enabled: bool) {
        self.jitter().direction().set_outbound(enabled);
    }

    // Latency controls.

    pub fn set_latency_enabled(&self, enabled: bool) {
        self.latency().set_enabled(enabled);
        if enabled {
            self.ensure_release_thread(DelaySlot::Latency);
        }
    }

    pub fn is_latency_enabled(&self) -> bool {
        self.latency().is_enabled()
    }

    pub fn set_latency_ms(&self, latency_ms: u64) {
        self.latency().set_latency_ms(latency_ms);
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency().latency_ms()
    }

    pub fn set_latency_inbound(&self, enabled: bool) {
        self.latency().direction().set_inbound(enabled);
    }

    pub fn set_latency_outbound(&self, enabled: bool) {
        self.latency().direction().set_outbound(enabled);
    }

    // Bandwidth controls.

    pub fn set_bandwidth_enabled(&self, enabled: bool) {
        self.bandwidth().set_enabled(enabled);
        if enabled {
            self.ensure_release_thread(DelaySlot::Bandwidth);
        }
    }

    pub fn is_bandwidth_enabled(&self) -> bool {
        self.bandwidth().is_enabled()
    }

    pub fn set_bandwidth_kbps(&self, kbps: u32) {
        self.bandwidth().set_kbps(kbps);
    }

    pub fn bandwidth_kbps(&self) -> u32 {
        self.bandwidth().kbps()
    }

    pub fn set_bandwidth_inbound(&self, enabled: bool) {
        self.bandwidth().direction().set_inbound(enabled);
    }

    pub fn set_bandwidth_outbound(&self, enabled: bool) {
        self.bandwidth().direction().set_outbound(enabled);
    }

    fn loss(&self) -> &LossStage {
        self.shared.pipeline.loss()
    }

    fn duplicate(&self) -> &DuplicateStage {
        self.shared.pipeline.duplicate()
    }

    fn reorder(&self) -> &ReorderStage {
        self.shared.pipeline.reorder()
    }

    fn jitter(&self) -> &JitterStage {
        self.shared.pipeline.jitter()
    }

    fn latency(&self) -> &LatencyStage {
        self.shared.pipeline.latency()
    }

    fn bandwidth(&self) -> &BandwidthStage {
        self.shared.pipeline.bandwidth()
    }

    fn ensure_release_thread(&self, slot: DelaySlot) {
        if !self.shared.is_capturing.load(Ordering::SeqCst) {
            return;
        }
        let mut release = self.release.lock();
        let entry = release.slot_mut(slot);
        if entry.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *entry = Some(self.spawn_release(slot));
    }

    fn spawn_release(&self, slot: DelaySlot) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        debug!(stage = slot.name(), "spawning release thread");
        thread::Builder::new()
            .name(format!("netfault-release-{}", slot.name()))
            .spawn(move || release_loop(&shared, slot))
            .expect("failed to spawn release thread")
    }
}

impl<D: DivertDriver> Drop for FaultEngine<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture loop run by each worker thread.
fn worker_loop<H: DivertHandle>(shared: &Shared<H>, handle: &H) {
    let (batch_size, buffer_size, max_packet) = {
        let params = shared.params.lock();
        (
            params.batch_size as usize,
            params.packet_buffer_size as usize,
            params.max_packet_size as usize,
        )
    };

    // The receive buffer is reused across iterations; packet bytes are
    // copied out once the header parse pins down each on-wire length.
    let mut packet_buf = vec![0u8; buffer_size];
    let mut addr_buf = vec![DivertAddress::default(); batch_size];

    while !shared.should_stop.load(Ordering::Relaxed) {
        let recv = match handle.recv_batch(&mut packet_buf, &mut addr_buf) {
            Ok(recv) => recv,
            Err(DivertRecvError::Shutdown) => break,
            Err(err) => {
                if shared.should_stop.load(Ordering::Relaxed) {
                    break;
                }
                warn!(%err, "batched receive failed");
                shared.set_error(err.to_string());
                continue;
            }
        };

        if recv.addr_count == 0 {
            continue;
        }
        shared.stats.record_batch(recv.addr_count as u64);

        let now = Instant::now();
        let mut batch = Vec::with_capacity(recv.addr_count);
        let mut offset = 0usize;

        for addr in addr_buf.iter().take(recv.addr_count) {
            if offset >= recv.recv_len {
                break;
            }
            let rest = &packet_buf[offset..recv.recv_len];
            let Some(wire_len) = PacketParser::wire_len(rest) else {
                break;
            };
            if wire_len == 0 || wire_len > rest.len() || wire_len > max_packet {
                break;
            }

            let data = rest[..wire_len].to_vec();
            let evicted = shared.ring.push(PacketParser::parse(&data, addr, now));
            shared.stats.record_info_dropped(evicted);
            shared.stats.record_captured(wire_len as u64);

            batch.push(Packet::new(data, *addr, now));
            offset += wire_len;
        }

        let residual = shared.pipeline.process(batch);
        if !residual.is_empty() {
            send_packets(shared, handle, &residual);
        }
    }

    debug!("capture worker exiting");
}

/// Poll loop run by each delay stage's release thread. Exits only on the
/// engine-wide stop flag, never on a stage disable, so a disabled stage's
/// leftover queue still gets flushed to the wire.
fn release_loop<H: DivertHandle>(shared: &Shared<H>, slot: DelaySlot) {
    while !shared.should_stop.load(Ordering::Relaxed) {
        thread::sleep(RELEASE_POLL);
        if shared.should_stop.load(Ordering::Relaxed) {
            break;
        }

        let due = slot.stage(&shared.pipeline).drain_due(Instant::now());
        if due.is_empty() {
            continue;
        }

        if let Some(handle) = shared.current_handle() {
            send_packets(shared, &handle, &due);
        }
    }

    debug!(stage = slot.name(), "release thread exiting");
}

/// Concatenate a batch into contiguous payload and address buffers and hand
/// it to the driver. Packets are lost on send failure, never retried.
fn send_packets<H: DivertHandle>(shared: &Shared<H>, handle: &H, packets: &[Packet]) {
    let total: usize = packets.iter().map(Packet::len).sum();
    let mut payload = Vec::with_capacity(total);
    let mut addrs = Vec::with_capacity(packets.len());
    for packet in packets {
        payload.extend_from_slice(&packet.data);
        addrs.push(packet.addr);
    }

    match handle.send_batch(&payload, &addrs) {
        Ok(sent) => shared.stats.record_injected(sent as u64),
        Err(err) => {
            warn!(%err, dropped = packets.len(), "batched send failed");
            shared.stats.record_send_failure();
            shared.set_error(err.to_string());
        }
    }
}
