//! netfault: user-space network impairment engine.
//!
//! An external kernel-mode diverter hands live IP packets to worker
//! threads, a fixed-order pipeline of impairment stages degrades the
//! traffic (loss, duplication, reordering, jitter, fixed latency, bandwidth
//! cap), and whatever survives is reinjected into the kernel stack. The
//! pipeline never synthesizes or mutates payload bytes; it only drops,
//! copies, reorders and delays.

mod address;
pub mod config;
mod divert;
mod engine;
mod packet;
mod parser;
mod ring;
mod rng;
mod stage;
mod stats;

#[cfg(test)]
mod tests;

pub use address::{format_ipv4, format_ipv6};
pub use config::{CaptureParams, ConfigError, Configuration, FilterPreset, HotkeyConfig};
pub use divert::{
    DivertAddress, DivertDriver, DivertHandle, DivertOpenError, DivertParam, DivertRecv,
    DivertRecvError, DivertSendError,
};
pub use engine::{DriverVersion, EngineError, FaultEngine, RELEASE_POLL};
pub use packet::Packet;
pub use parser::{IpAddress, PacketInfo, PacketParser, PROTO_TCP, PROTO_UDP};
pub use ring::MonitorRing;
pub use rng::RandomSource;
pub use stage::{
    BandwidthStage, DirectionFilter, DuplicateStage, JitterStage, LatencyStage, LossStage,
    Pipeline, ReorderStage, Stage,
};
pub use stats::{EngineStats, StatsSnapshot};
