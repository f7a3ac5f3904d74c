//! Device objects
//!
//! Devices are fixed-cardinality: the runtime enumerates them once at
//! construction and they live until process shutdown. Each device owns
//! exactly one [`Context`], which can be initialized and destroyed
//! repeatedly across the device's lifetime.

use std::sync::Arc;

use pulse_transport::DeviceInfo;

use crate::context::Context;

/// One accelerator device: immutable descriptor plus its owned context
pub struct Device {
    id: u8,
    info: DeviceInfo,
    ctx: Arc<Context>,
}

impl Device {
    pub(crate) fn new(id: u8, info: DeviceInfo, ctx: Arc<Context>) -> Self {
        Self { id, info, ctx }
    }

    /// Device ordinal, the value embedded in this device's virtual pointers
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Hardware descriptor
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Number of usable compute cores
    pub fn cores(&self) -> usize {
        self.info.cores
    }

    /// Total device memory in bytes
    pub fn memory_size(&self) -> u64 {
        self.info.memory_size
    }

    /// The device's context
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("cores", &self.info.cores)
            .field("active", &self.ctx.is_active())
            .finish()
    }
}
