//! Immutable hardware descriptors reported by a transport

use serde::{Deserialize, Serialize};

/// Static description of one accelerator device
///
/// Enumerated once when the transport comes up and never mutated afterwards.
/// Sensor readings (temperatures, power draw) are deliberately not part of
/// this type; they belong to the telemetry layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device ordinal as seen by the transport
    pub ordinal: usize,
    /// Human-readable model name
    pub name: String,
    /// Number of usable compute cores
    pub cores: usize,
    /// Total device memory in bytes
    pub memory_size: u64,
    /// L1 data cache size in bytes
    pub cache_l1d: u32,
    /// L1 instruction cache size in bytes
    pub cache_l1i: u32,
    /// L2 cache size in bytes
    pub cache_l2: u32,
    /// Last-level cache size in bytes
    pub cache_llc: u32,
    /// Core clock in MHz
    pub clock_rate: u32,
    /// Base clock in MHz
    pub clock_base: u32,
    /// Memory clock in MHz
    pub clock_memory: u32,
    /// Sensor device id for telemetry lookups
    pub sensor_id: u32,
    /// NUMA node the device is attached to
    pub numa_id: u32,
    /// ABI version of the device firmware interface
    pub version_abi: u32,
    /// Firmware version
    pub version_firmware: u32,
}

impl DeviceInfo {
    /// A plausible descriptor for the emulated software device
    pub fn emulated(ordinal: usize) -> Self {
        Self {
            ordinal,
            name: format!("pulse-emulated-{ordinal}"),
            cores: 8,
            memory_size: 48 * 1024 * 1024 * 1024,
            cache_l1d: 64 * 1024,
            cache_l1i: 64 * 1024,
            cache_l2: 512 * 1024,
            cache_llc: 16 * 1024 * 1024,
            clock_rate: 1600,
            clock_base: 1400,
            clock_memory: 1600,
            sensor_id: ordinal as u32,
            numa_id: 0,
            version_abi: 2,
            version_firmware: 54,
        }
    }
}
