//! Contract with the kernel-mode packet diverter.
//!
//! The engine never talks to the kernel itself; it drives an opaque driver
//! handle that redirects packets at the network layer and accepts
//! reinjections. Everything the engine needs from that driver is captured by
//! the two traits below, which keeps the core testable against an in-memory
//! implementation.

use thiserror::Error;

/// Per-packet address record filled in by the driver on receive and handed
/// back unchanged on send.
///
/// The core treats it as opaque apart from the direction and loopback bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DivertAddress {
    /// Packet was heading out of this host.
    pub outbound: bool,
    /// Packet is on the loopback interface.
    pub loopback: bool,
    /// Interface index the packet was seen on.
    pub if_idx: u32,
}

/// Driver parameters reachable through `set_param` / `get_param`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivertParam {
    QueueLength,
    QueueTime,
    QueueSize,
    VersionMajor,
    VersionMinor,
}

/// Outcome of a successful batched receive.
#[derive(Debug, Clone, Copy)]
pub struct DivertRecv {
    /// Bytes written into the packet buffer. Packets are concatenated
    /// back-to-back; lengths are recovered from the IP headers.
    pub recv_len: usize,
    /// Number of address records filled in (= packets received).
    pub addr_count: usize,
}

#[derive(Debug, Error)]
pub enum DivertRecvError {
    /// The receive side was shut down; no more packets will arrive.
    #[error("diverter receive side shut down")]
    Shutdown,
    /// Any other driver-level failure. Non-fatal to the engine.
    #[error("diverter receive failed: os error {0}")]
    Os(i32),
}

#[derive(Debug, Error)]
pub enum DivertSendError {
    #[error("diverter send failed: os error {0}")]
    Os(i32),
}

/// Recognizable failures when opening the diverter.
#[derive(Debug, Error)]
pub enum DivertOpenError {
    #[error("access denied opening the diverter (elevation required)")]
    AccessDenied,
    #[error("diverter service is not installed")]
    ServiceMissing,
    #[error("diverter driver files are missing")]
    FilesMissing,
    #[error("diverter open failed: os error {0}")]
    Other(i32),
}

/// An open diverter handle.
///
/// The driver is documented to serialize concurrent batched receives and
/// sends, so a single handle is shared by every worker and release thread
/// between `start` and `stop`.
pub trait DivertHandle: Send + Sync + 'static {
    /// Receive a batch of packets. Blocks until at least one packet is
    /// available or [`shutdown_recv`](Self::shutdown_recv) is called.
    ///
    /// At most `addrs.len()` packets are returned, concatenated into
    /// `packets`.
    fn recv_batch(
        &self,
        packets: &mut [u8],
        addrs: &mut [DivertAddress],
    ) -> Result<DivertRecv, DivertRecvError>;

    /// Reinject a batch of packets. `packets` holds the payloads
    /// concatenated in address order. Returns the number of packets sent.
    fn send_batch(&self, packets: &[u8], addrs: &[DivertAddress])
        -> Result<usize, DivertSendError>;

    /// Set a driver parameter. Returns `false` if the driver rejects it.
    fn set_param(&self, param: DivertParam, value: u64) -> bool;

    /// Read a driver parameter, if the driver knows it.
    fn get_param(&self, param: DivertParam) -> Option<u64>;

    /// Unblock pending and future `recv_batch` calls.
    fn shutdown_recv(&self);

    /// Release the handle. Called once, after all threads have quiesced.
    fn close(&self);
}

/// Factory side of the contract: opens a handle for a given filter string.
pub trait DivertDriver: Send + Sync + 'static {
    type Handle: DivertHandle;

    fn open(&self, filter: &str) -> Result<Self::Handle, DivertOpenError>;
}
