//! The process-wide runtime registry
//!
//! [`Runtime`] owns the fixed set of devices a transport exposes and the
//! bookkeeping that spans them: the proc-id map filled in as contexts come
//! up, and the per-thread current-context stacks. It is an explicit object
//! rather than ambient global state; embedders create one per transport and
//! drop it to tear everything down.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use pulse_transport::{HostBuffer, ProcId, Transport};

use crate::config::RuntimeConfig;
use crate::context::{Context, ContextMode};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::vptr::VirtualPtr;

/// Process-wide device and context registry
pub struct Runtime {
    transport: Arc<dyn Transport>,
    devices: Vec<Arc<Device>>,
    /// Transport process id -> owning device ordinal
    procs: Arc<DashMap<ProcId, u8>>,
    /// Per-thread current-context stacks
    current: Mutex<HashMap<ThreadId, Vec<Arc<Context>>>>,
}

impl Runtime {
    /// Bring the runtime up with configuration from the environment
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_config(transport, RuntimeConfig::from_env())
    }

    /// Bring the runtime up, enumerating the transport's devices
    pub fn with_config(transport: Arc<dyn Transport>, config: RuntimeConfig) -> Result<Self> {
        let count = transport.device_count();
        if count == 0 {
            return Err(Error::NoDevices);
        }
        // Device ids must fit the pointer encoding's device field.
        let count = count.min(1 << pulse_transport::layout::DEVICE_BITS);

        let procs: Arc<DashMap<ProcId, u8>> = Arc::new(DashMap::new());
        let mut devices = Vec::with_capacity(count);
        for ordinal in 0..count {
            let info = transport.device_info(ordinal)?;
            let ctx = Arc::new(Context::new(
                ordinal as u8,
                info.clone(),
                transport.clone(),
                config.clone(),
                procs.clone(),
            ));
            devices.push(Arc::new(Device::new(ordinal as u8, info, ctx)));
        }

        debug!(devices = devices.len(), "runtime initialized");
        Ok(Self {
            transport,
            devices,
            procs,
            current: Mutex::new(HashMap::new()),
        })
    }

    /// Number of enumerated devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Device by ordinal
    pub fn device(&self, ordinal: u8) -> Result<&Arc<Device>> {
        self.devices
            .get(ordinal as usize)
            .ok_or(Error::InvalidDevice(ordinal))
    }

    /// Device owning the transport process `proc`
    pub fn device_for_proc(&self, proc: ProcId) -> Result<&Arc<Device>> {
        let ordinal = *self.procs.get(&proc).ok_or(Error::UnknownContext)?;
        self.device(ordinal)
    }

    /// Context owning `ptr`, via the pointer's embedded device id
    pub fn ctx_for_ptr(&self, ptr: VirtualPtr) -> Result<Arc<Context>> {
        Ok(self.device(ptr.device())?.ctx().clone())
    }

    // ------------------------------------------------------------------
    // Context lifecycle and the current-context stack
    // ------------------------------------------------------------------

    /// Initialize the device's context and make it current on this thread
    pub fn ctx_create(&self, ordinal: u8, mode: ContextMode) -> Result<Arc<Context>> {
        let ctx = self.device(ordinal)?.ctx().clone();
        ctx.init(mode)?;
        self.push_current(ctx.clone());
        Ok(ctx)
    }

    /// Destroy a context and drop it from every thread's stack
    pub fn ctx_destroy(&self, ctx: &Arc<Context>) -> Result<()> {
        {
            let mut current = self.current.lock();
            for stack in current.values_mut() {
                stack.retain(|c| !Arc::ptr_eq(c, ctx));
            }
        }
        ctx.destroy()
    }

    /// Push a context onto the calling thread's stack
    pub fn push_current(&self, ctx: Arc<Context>) {
        let mut current = self.current.lock();
        current
            .entry(std::thread::current().id())
            .or_default()
            .push(ctx);
    }

    /// Pop the calling thread's current context
    pub fn pop_current(&self) -> Result<Arc<Context>> {
        let mut current = self.current.lock();
        current
            .get_mut(&std::thread::current().id())
            .and_then(Vec::pop)
            .ok_or(Error::UnknownContext)
    }

    /// Replace the top of the calling thread's stack
    ///
    /// `None` just pops; `Some` pops (if anything is there) and pushes.
    pub fn set_current(&self, ctx: Option<Arc<Context>>) {
        let mut current = self.current.lock();
        let stack = current.entry(std::thread::current().id()).or_default();
        stack.pop();
        if let Some(ctx) = ctx {
            stack.push(ctx);
        }
    }

    /// The calling thread's current context
    pub fn current(&self) -> Result<Arc<Context>> {
        let current = self.current.lock();
        current
            .get(&std::thread::current().id())
            .and_then(|stack| stack.last())
            .cloned()
            .ok_or(Error::UnknownContext)
    }

    // ------------------------------------------------------------------
    // Cross-device operations
    // ------------------------------------------------------------------

    /// Copy between two device pointers, staging through the host when they
    /// live on different devices
    ///
    /// The cross-device path is synchronous from the caller's point of view:
    /// the intermediate host buffer has no stream-ordering guarantee, so
    /// each leg is drained before the next begins.
    pub fn memcpy(&self, dst: VirtualPtr, src: VirtualPtr, size: u64) -> Result<()> {
        if dst.is_null() || src.is_null() {
            return Err(Error::InvalidValue("memcpy endpoints must be non-null"));
        }
        if dst.device() == src.device() {
            return self.ctx_for_ptr(dst)?.memcpy_d2d(dst, src, size, 0);
        }

        let src_ctx = self.ctx_for_ptr(src)?;
        let dst_ctx = self.ctx_for_ptr(dst)?;

        let staging = HostBuffer::new(size as usize);
        src_ctx.memcpy_d2h_async(staging.clone(), src, size, 0)?;
        src_ctx.sync_stream(0)?;

        let bytes = staging.to_vec();
        dst_ctx.memcpy_h2d_async(dst, &bytes, 0)?;
        dst_ctx.sync_stream(0)
    }

    /// Log live allocations of every active context
    pub fn mem_report(&self) {
        for device in &self.devices {
            if device.ctx().is_active() {
                if let Err(err) = device.ctx().mem_report() {
                    warn!(device = device.id(), %err, "memory report failed");
                }
            }
        }
    }

    /// Destroy every active context
    ///
    /// Invoked by `Drop`; callable explicitly to observe errors.
    pub fn shutdown(&self) -> Result<()> {
        self.current.lock().clear();
        let mut first_err = None;
        for device in &self.devices {
            if device.ctx().is_active() {
                if let Err(err) = device.ctx().destroy() {
                    warn!(device = device.id(), %err, "context teardown failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The transport this runtime drives
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("devices", &self.devices.len())
            .field("live_procs", &self.procs.len())
            .finish()
    }
}
