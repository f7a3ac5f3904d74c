//! The transport call contract

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device_info::DeviceInfo;
use crate::error::Result;

/// Opaque handle to an offload process running on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcHandle(pub u64);

/// Transport-assigned identifier of an offload process
///
/// Unlike [`ProcHandle`], which is only meaningful to the transport that
/// issued it, the process id is stable enough to key process-wide registries.
pub type ProcId = u32;

/// Opaque handle to one execution stream within an offload process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Opaque handle to a module loaded into an offload process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Opaque handle to a function resolved from a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncHandle(pub u64);

/// Identifier of one submitted asynchronous request
pub type RequestId = u64;

/// Execution state of a stream, as reported by the transport
///
/// Advisory only; the authoritative way to observe completion is
/// [`Transport::wait_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// State could not be determined
    Unknown,
    /// The stream is executing a request
    Running,
    /// The stream is blocked in a system call on the device
    Syscall,
    /// The stream is blocked waiting for work
    Blocked,
    /// The stream has drained all submitted requests
    Exited,
}

/// Raw completion codes of device-side helper routines
///
/// These are the values a request's raw result carries when the submitting
/// caller asked for result checking.
pub mod status {
    /// Request completed successfully
    pub const OK: u64 = 0;
    /// The device-side directory has no entry for the pointer
    pub const UNKNOWN_VPTR: u64 = 1;
    /// The device could not satisfy an allocation
    pub const OUT_OF_MEMORY: u64 = 2;
    /// The request's arguments did not validate on the device
    pub const INVALID_ARGS: u64 = 3;
}

/// One argument of a device-side call, as marshalled onto the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    /// 8-bit value
    U8(u8),
    /// 16-bit value
    U16(u16),
    /// 32-bit value
    U32(u32),
    /// 64-bit value (also used for pointers and sizes)
    U64(u64),
}

impl CallArg {
    /// Widen to a 64-bit value, the representation requests travel in
    #[inline]
    pub fn widen(&self) -> u64 {
        match *self {
            CallArg::U8(v) => v as u64,
            CallArg::U16(v) => v as u64,
            CallArg::U32(v) => v as u64,
            CallArg::U64(v) => v,
        }
    }
}

impl From<u8> for CallArg {
    fn from(v: u8) -> Self {
        CallArg::U8(v)
    }
}

impl From<u16> for CallArg {
    fn from(v: u16) -> Self {
        CallArg::U16(v)
    }
}

impl From<u32> for CallArg {
    fn from(v: u32) -> Self {
        CallArg::U32(v)
    }
}

impl From<u64> for CallArg {
    fn from(v: u64) -> Self {
        CallArg::U64(v)
    }
}

/// Shareable host-side staging buffer for asynchronous reads
///
/// A device-to-host read enqueued on a stream completes at an unknown later
/// point; the destination therefore has to outlive the caller's borrow. The
/// buffer is cheaply cloneable and all clones observe the same bytes.
#[derive(Debug, Clone)]
pub struct HostBuffer(Arc<Mutex<Vec<u8>>>);

impl HostBuffer {
    /// Create a zeroed buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0u8; len])))
    }

    /// Create a buffer holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self(Arc::new(Mutex::new(data.to_vec())))
    }

    /// Buffer length in bytes
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Copy the buffer contents into `dst`
    ///
    /// # Panics
    ///
    /// Panics if `dst` is shorter than the buffer.
    pub fn read_into(&self, dst: &mut [u8]) {
        let inner = self.0.lock();
        dst[..inner.len()].copy_from_slice(&inner);
    }

    /// Overwrite the buffer contents from `src`, resizing to match
    pub fn write_from(&self, src: &[u8]) {
        let mut inner = self.0.lock();
        inner.clear();
        inner.extend_from_slice(src);
    }

    /// Take a copy of the contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

/// The narrow call contract the pulse runtime relies on
///
/// One implementation drives real hardware through a vendor offload library;
/// [`crate::EmulatedTransport`] executes everything in-process. All methods
/// are safe to call from multiple threads; per-stream request ordering is the
/// caller's responsibility (the runtime serializes per stream).
pub trait Transport: Send + Sync {
    /// Number of devices visible to this transport
    fn device_count(&self) -> usize;

    /// Static descriptor of device `ordinal`
    fn device_info(&self, ordinal: usize) -> Result<DeviceInfo>;

    /// Create an offload process on device `ordinal` with `workers`
    /// device-side execution units
    fn create_process(&self, ordinal: usize, workers: usize) -> Result<ProcHandle>;

    /// Tear down an offload process and everything it owns
    fn destroy_process(&self, proc: ProcHandle) -> Result<()>;

    /// Stable identifier of a live process
    fn proc_identifier(&self, proc: ProcHandle) -> Result<ProcId>;

    /// Open an execution stream within a process
    fn open_stream(&self, proc: ProcHandle) -> Result<StreamHandle>;

    /// Load a module into the process
    fn load_module(&self, proc: ProcHandle, name: &str) -> Result<ModuleHandle>;

    /// Unload a previously loaded module
    fn unload_module(&self, proc: ProcHandle, module: ModuleHandle) -> Result<()>;

    /// Resolve a function symbol from a loaded module
    fn resolve_symbol(&self, proc: ProcHandle, module: ModuleHandle, name: &str)
        -> Result<FuncHandle>;

    /// Submit an asynchronous function call
    fn enqueue_call(
        &self,
        stream: StreamHandle,
        func: FuncHandle,
        args: &[CallArg],
    ) -> Result<RequestId>;

    /// Submit an asynchronous anonymous device allocation
    ///
    /// The allocation stays unbound until a device-side `mem_assign` claims
    /// it; its raw result is not meaningful to the host.
    fn enqueue_alloc(&self, stream: StreamHandle, size: u64) -> Result<RequestId>;

    /// Submit an asynchronous free of a raw device address
    fn enqueue_free(&self, stream: StreamHandle, addr: u64) -> Result<RequestId>;

    /// Submit an asynchronous device-to-host read into `dst`
    fn enqueue_read(
        &self,
        stream: StreamHandle,
        dst: HostBuffer,
        src: u64,
        len: u64,
    ) -> Result<RequestId>;

    /// Submit an asynchronous host-to-device write
    ///
    /// The bytes are captured at submission time.
    fn enqueue_write(&self, stream: StreamHandle, dst: u64, src: &[u8]) -> Result<RequestId>;

    /// Block until `req` completes and return its raw result
    fn wait_result(&self, stream: StreamHandle, req: RequestId) -> Result<u64>;

    /// Best-effort snapshot of a stream's execution state
    fn stream_state(&self, stream: StreamHandle) -> StreamState;
}
