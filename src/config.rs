//! Capture parameters, filter presets and TOML persistence.
//!
//! The file format is sectioned key/value: `[Driver]`, `[Performance]`,
//! `[Network]`, `[Hotkey]` and an array of `[[FilterPresets]]` tables. Any
//! missing section or key falls back to its default, so old files keep
//! loading as new keys appear.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "netfault.toml";

// Driver queue defaults.
pub const DEFAULT_QUEUE_LENGTH: u64 = 8192;
pub const DEFAULT_QUEUE_TIME: u64 = 2000;
pub const DEFAULT_QUEUE_SIZE: u64 = 4_194_304;

// Performance defaults.
pub const DEFAULT_BATCH_SIZE: u32 = 10;
pub const DEFAULT_WORKER_THREADS: u32 = 1;
pub const DEFAULT_PACKET_BUFFER_SIZE: u32 = 16_384;
pub const DEFAULT_RING_CAPACITY: usize = 1024;

// Network defaults.
pub const DEFAULT_MTU_SIZE: u32 = 1500;
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 65_535;

/// Everything the engine needs to open the driver and size its buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureParams {
    /// Driver queue length (packets held in the kernel queue).
    pub queue_length: u64,
    /// Driver queue time in milliseconds.
    pub queue_time: u64,
    /// Driver queue size in bytes.
    pub queue_size: u64,

    /// Maximum packets per batched receive.
    pub batch_size: u32,
    pub worker_threads: u32,
    /// Per-worker receive buffer in bytes; must fit any valid packet.
    pub packet_buffer_size: u32,
    /// Monitoring ring bound.
    pub ring_capacity: usize,

    pub mtu_size: u32,
    pub max_packet_size: u32,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            queue_length: DEFAULT_QUEUE_LENGTH,
            queue_time: DEFAULT_QUEUE_TIME,
            queue_size: DEFAULT_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            packet_buffer_size: DEFAULT_PACKET_BUFFER_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
            mtu_size: DEFAULT_MTU_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Named filter string selectable from the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPreset {
    pub name: String,
    pub filter: String,
}

/// Capture hotkey as plain data; the control surface interprets the key
/// code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HotkeyConfig {
    pub enabled: bool,
    pub key: u32,
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
}

/// Full persisted configuration: parameters, presets and hotkey.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub params: CaptureParams,
    pub filter_presets: Vec<FilterPreset>,
    pub hotkey: HotkeyConfig,
}

/// Built-in filter presets, written on first save.
pub fn default_presets() -> Vec<FilterPreset> {
    let preset = |name: &str, filter: &str| FilterPreset {
        name: name.to_string(),
        filter: filter.to_string(),
    };
    vec![
        preset("All", "true"),
        preset("TCP", "tcp"),
        preset("UDP", "udp"),
        preset("HTTP", "tcp.DstPort == 80 or tcp.SrcPort == 80"),
        preset("HTTPS", "tcp.DstPort == 443 or tcp.SrcPort == 443"),
        preset("DNS", "udp.DstPort == 53 or udp.SrcPort == 53"),
        preset(
            "Local",
            "(ip.DstAddr >= 10.0.0.0 and ip.DstAddr <= 10.255.255.255) or \
             (ip.DstAddr >= 172.16.0.0 and ip.DstAddr <= 172.31.255.255) or \
             (ip.DstAddr >= 192.168.0.0 and ip.DstAddr <= 192.168.255.255)",
        ),
        preset("Loopback exclusion", "!loopback"),
        preset("Disable", "false"),
    ]
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// On-disk schema. Kept separate from the runtime types so the file layout
// can stay stable while the runtime structs evolve.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileSchema {
    #[serde(rename = "Driver")]
    driver: DriverSection,
    #[serde(rename = "Performance")]
    performance: PerformanceSection,
    #[serde(rename = "Network")]
    network: NetworkSection,
    #[serde(rename = "Hotkey")]
    hotkey: HotkeyConfig,
    #[serde(rename = "FilterPresets")]
    filter_presets: Vec<FilterPreset>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct DriverSection {
    queue_length: u64,
    queue_time: u64,
    queue_size: u64,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            queue_length: DEFAULT_QUEUE_LENGTH,
            queue_time: DEFAULT_QUEUE_TIME,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct PerformanceSection {
    batch_size: u32,
    worker_threads: u32,
    packet_buffer_size: u32,
    ring_capacity: usize,
}

impl Default for PerformanceSection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            packet_buffer_size: DEFAULT_PACKET_BUFFER_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct NetworkSection {
    #[serde(rename = "MTUSize")]
    mtu_size: u32,
    #[serde(rename = "MaxPacketSize")]
    max_packet_size: u32,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            mtu_size: DEFAULT_MTU_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl From<FileSchema> for Configuration {
    fn from(file: FileSchema) -> Self {
        let filter_presets = if file.filter_presets.is_empty() {
            default_presets()
        } else {
            file.filter_presets
        };
        Self {
            params: CaptureParams {
                queue_length: file.driver.queue_length,
                queue_time: file.driver.queue_time,
                queue_size: file.driver.queue_size,
                batch_size: file.performance.batch_size,
                worker_threads: file.performance.worker_threads,
                packet_buffer_size: file.performance.packet_buffer_size,
                ring_capacity: file.performance.ring_capacity,
                mtu_size: file.network.mtu_size,
                max_packet_size: file.network.max_packet_size,
            },
            filter_presets,
            hotkey: file.hotkey,
        }
    }
}

impl From<&Configuration> for FileSchema {
    fn from(config: &Configuration) -> Self {
        Self {
            driver: DriverSection {
                queue_length: config.params.queue_length,
                queue_time: config.params.queue_time,
                queue_size: config.params.queue_size,
            },
            performance: PerformanceSection {
                batch_size: config.params.batch_size,
                worker_threads: config.params.worker_threads,
                packet_buffer_size: config.params.packet_buffer_size,
                ring_capacity: config.params.ring_capacity,
            },
            network: NetworkSection {
                mtu_size: config.params.mtu_size,
                max_packet_size: config.params.max_packet_size,
            },
            hotkey: config.hotkey.clone(),
            filter_presets: config.filter_presets.clone(),
        }
    }
}

/// Load a configuration file. Missing keys take defaults; an empty preset
/// list is replaced with the built-in presets.
pub fn load(path: impl AsRef<Path>) -> Result<Configuration, ConfigError> {
    let text = fs::read_to_string(path)?;
    let file: FileSchema = toml::from_str(&text)?;
    Ok(file.into())
}

/// Write a configuration file, overwriting any existing one.
pub fn save(path: impl AsRef<Path>, config: &Configuration) -> Result<(), ConfigError> {
    let file = FileSchema::from(config);
    let text = toml::to_string_pretty(&file)?;
    fs::write(path, text)?;
    Ok(())
}

/// Write a fresh default configuration with the built-in presets.
pub fn create_default(path: impl AsRef<Path>) -> Result<Configuration, ConfigError> {
    let config = Configuration {
        params: CaptureParams::default(),
        filter_presets: default_presets(),
        hotkey: HotkeyConfig::default(),
    };
    save(path, &config)?;
    Ok(config)
}
