//! Device-bound execution contexts
//!
//! A [`Context`] owns one offload process on its device, the streams that
//! feed it, the loaded standard helper module, and the allocation table that
//! backs the virtual-pointer address space. All allocation, free, copy, fill
//! and swap operations are orchestrated here: each one enqueues work on a
//! chosen stream and keeps the table consistent with what the device will
//! eventually report.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use pulse_transport::{
    CallArg, DeviceInfo, FuncHandle, HostBuffer, ModuleHandle, ProcHandle, ProcId, StreamState,
    Transport,
};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::stream::{AddrState, CallSlot, ResultDest, Stream};
use crate::table::AllocTable;
use crate::vptr::VirtualPtr;

/// How a context divides its device cores at init time
///
/// Trades stream concurrency against per-stream parallelism: `Parallel` runs
/// one stream whose calls fan out over all workers; `Scalar` runs one stream
/// per worker, each single-threaded on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// One stream, N device-side workers
    Parallel,
    /// N streams, one device-side worker each
    Scalar,
}

/// Destination of a fill operation, selecting the helper-routine family
///
/// Virtual pointers go through the device-side pointer directory; raw
/// addresses (obtained from [`Context::raw_ptr`]) bypass it.
#[derive(Debug, Clone, Copy)]
pub enum FillDst {
    /// A virtual device pointer
    Device(VirtualPtr),
    /// A raw host-visible device address
    Raw(u64),
}

impl FillDst {
    fn wire(self) -> u64 {
        match self {
            FillDst::Device(ptr) => ptr.raw(),
            FillDst::Raw(addr) => addr,
        }
    }

    fn is_raw(self) -> bool {
        matches!(self, FillDst::Raw(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillWidth {
    U8,
    U16,
    U32,
    U64,
    U128,
}

/// Device-side helper routines of the standard module, resolved once at
/// context init. Order defines the handle-table layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    MemAssign,
    MemRemove,
    MemPtr,
    MemSize,
    MemSwap,
    MemcpyD2D,
    MemsetU8,
    MemsetU16,
    MemsetU32,
    MemsetU64,
    MemsetU128,
    MemsetU8_2D,
    MemsetU16_2D,
    MemsetU32_2D,
    MemsetU64_2D,
    MemsetU128_2D,
    RawMemcpyD2D,
    RawMemsetU8,
    RawMemsetU16,
    RawMemsetU32,
    RawMemsetU64,
    RawMemsetU128,
    RawMemsetU8_2D,
    RawMemsetU16_2D,
    RawMemsetU32_2D,
    RawMemsetU64_2D,
    RawMemsetU128_2D,
}

impl Builtin {
    const ALL: [Builtin; 27] = [
        Builtin::MemAssign,
        Builtin::MemRemove,
        Builtin::MemPtr,
        Builtin::MemSize,
        Builtin::MemSwap,
        Builtin::MemcpyD2D,
        Builtin::MemsetU8,
        Builtin::MemsetU16,
        Builtin::MemsetU32,
        Builtin::MemsetU64,
        Builtin::MemsetU128,
        Builtin::MemsetU8_2D,
        Builtin::MemsetU16_2D,
        Builtin::MemsetU32_2D,
        Builtin::MemsetU64_2D,
        Builtin::MemsetU128_2D,
        Builtin::RawMemcpyD2D,
        Builtin::RawMemsetU8,
        Builtin::RawMemsetU16,
        Builtin::RawMemsetU32,
        Builtin::RawMemsetU64,
        Builtin::RawMemsetU128,
        Builtin::RawMemsetU8_2D,
        Builtin::RawMemsetU16_2D,
        Builtin::RawMemsetU32_2D,
        Builtin::RawMemsetU64_2D,
        Builtin::RawMemsetU128_2D,
    ];

    fn symbol(self) -> &'static str {
        match self {
            Builtin::MemAssign => "pulse_mem_assign",
            Builtin::MemRemove => "pulse_mem_remove",
            Builtin::MemPtr => "pulse_mem_ptr",
            Builtin::MemSize => "pulse_mem_size",
            Builtin::MemSwap => "pulse_mem_swap",
            Builtin::MemcpyD2D => "pulse_memcpy_d2d",
            Builtin::MemsetU8 => "pulse_memset_u8",
            Builtin::MemsetU16 => "pulse_memset_u16",
            Builtin::MemsetU32 => "pulse_memset_u32",
            Builtin::MemsetU64 => "pulse_memset_u64",
            Builtin::MemsetU128 => "pulse_memset_u128",
            Builtin::MemsetU8_2D => "pulse_memset_u8_2d",
            Builtin::MemsetU16_2D => "pulse_memset_u16_2d",
            Builtin::MemsetU32_2D => "pulse_memset_u32_2d",
            Builtin::MemsetU64_2D => "pulse_memset_u64_2d",
            Builtin::MemsetU128_2D => "pulse_memset_u128_2d",
            Builtin::RawMemcpyD2D => "pulse_raw_memcpy_d2d",
            Builtin::RawMemsetU8 => "pulse_raw_memset_u8",
            Builtin::RawMemsetU16 => "pulse_raw_memset_u16",
            Builtin::RawMemsetU32 => "pulse_raw_memset_u32",
            Builtin::RawMemsetU64 => "pulse_raw_memset_u64",
            Builtin::RawMemsetU128 => "pulse_raw_memset_u128",
            Builtin::RawMemsetU8_2D => "pulse_raw_memset_u8_2d",
            Builtin::RawMemsetU16_2D => "pulse_raw_memset_u16_2d",
            Builtin::RawMemsetU32_2D => "pulse_raw_memset_u32_2d",
            Builtin::RawMemsetU64_2D => "pulse_raw_memset_u64_2d",
            Builtin::RawMemsetU128_2D => "pulse_raw_memset_u128_2d",
        }
    }

    /// Select the fill routine for a destination kind, element width and
    /// dimensionality
    fn fill(raw: bool, width: FillWidth, two_d: bool) -> Builtin {
        use Builtin::*;
        use FillWidth::*;
        match (raw, width, two_d) {
            (false, U8, false) => MemsetU8,
            (false, U16, false) => MemsetU16,
            (false, U32, false) => MemsetU32,
            (false, U64, false) => MemsetU64,
            (false, U128, false) => MemsetU128,
            (false, U8, true) => MemsetU8_2D,
            (false, U16, true) => MemsetU16_2D,
            (false, U32, true) => MemsetU32_2D,
            (false, U64, true) => MemsetU64_2D,
            (false, U128, true) => MemsetU128_2D,
            (true, U8, false) => RawMemsetU8,
            (true, U16, false) => RawMemsetU16,
            (true, U32, false) => RawMemsetU32,
            (true, U64, false) => RawMemsetU64,
            (true, U128, false) => RawMemsetU128,
            (true, U8, true) => RawMemsetU8_2D,
            (true, U16, true) => RawMemsetU16_2D,
            (true, U32, true) => RawMemsetU32_2D,
            (true, U64, true) => RawMemsetU64_2D,
            (true, U128, true) => RawMemsetU128_2D,
        }
    }
}

/// A module loaded into this context's offload process
#[derive(Debug, Clone)]
pub struct Module {
    /// Native handle, also the module-table key
    pub handle: ModuleHandle,
    /// Name it was loaded under
    pub name: String,
}

/// Everything that only exists while the context is active
struct ActiveState {
    mode: ContextMode,
    proc: ProcHandle,
    proc_id: ProcId,
    stdlib: ModuleHandle,
    builtins: Vec<FuncHandle>,
    streams: Vec<Stream>,
}

impl ActiveState {
    fn stream(&self, index: usize) -> Result<&Stream> {
        self.streams.get(index).ok_or(Error::UnknownStream(index))
    }

    fn builtin(&self, builtin: Builtin) -> FuncHandle {
        self.builtins[builtin as usize]
    }
}

/// A device-bound execution environment
///
/// Lifecycle is `Uninitialized -> Active -> Uninitialized`; `init` and
/// `destroy` move between the states and may be cycled repeatedly. Every
/// other operation requires an active context, with one deliberate
/// exception: [`Context::free`] on an inactive context is a silent no-op,
/// because frees racing a teardown are routine and harmless.
pub struct Context {
    device_id: u8,
    info: DeviceInfo,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    /// Shared proc-id registry, maintained on init/destroy
    procs: Arc<DashMap<ProcId, u8>>,
    active: RwLock<Option<ActiveState>>,
    table: Mutex<AllocTable>,
    modules: Mutex<HashMap<u64, Module>>,
}

impl Context {
    pub(crate) fn new(
        device_id: u8,
        info: DeviceInfo,
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
        procs: Arc<DashMap<ProcId, u8>>,
    ) -> Self {
        Self {
            device_id,
            info,
            transport,
            config,
            procs,
            active: RwLock::new(None),
            table: Mutex::new(AllocTable::new()),
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Ordinal of the owning device
    pub fn device(&self) -> u8 {
        self.device_id
    }

    /// Descriptor of the owning device
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_active(&self) -> bool {
        self.active.read().is_some()
    }

    /// Mode the context was initialized with
    pub fn mode(&self) -> Result<ContextMode> {
        Ok(self.active.read().as_ref().ok_or(Error::ContextDestroyed)?.mode)
    }

    pub fn stream_count(&self) -> Result<usize> {
        Ok(self.active.read().as_ref().ok_or(Error::ContextDestroyed)?.streams.len())
    }

    /// Transport-assigned process id while active
    pub fn proc_id(&self) -> Result<ProcId> {
        Ok(self.active.read().as_ref().ok_or(Error::ContextDestroyed)?.proc_id)
    }

    /// Handle of the standard helper module loaded at init
    ///
    /// Useful with [`Context::module_function`] to call device-side helpers
    /// directly.
    pub fn stdlib_module(&self) -> Result<ModuleHandle> {
        Ok(self.active.read().as_ref().ok_or(Error::ContextDestroyed)?.stdlib)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bring the context up: create the offload process, load the standard
    /// module, resolve its helper routines and open the streams
    ///
    /// Process creation or standard-module failure aborts the init and
    /// leaves the context uninitialized.
    pub fn init(&self, mode: ContextMode) -> Result<()> {
        let mut active = self.active.write();
        if active.is_some() {
            return Err(Error::AlreadyActive);
        }

        let mut workers = self.info.cores.max(1);
        if self.config.workers > 0 {
            workers = workers.min(self.config.workers);
        }
        let stream_count = match mode {
            ContextMode::Parallel => 1,
            ContextMode::Scalar => workers,
        };

        let proc = self.transport.create_process(self.device_id as usize, workers)?;

        // Everything past process creation has to unwind the process on
        // failure, or the device leaks a worker pool.
        let setup = (|| -> Result<ActiveState> {
            let stdlib = self.transport.load_module(proc, &self.config.stdlib)?;
            let builtins = Builtin::ALL
                .iter()
                .map(|b| self.transport.resolve_symbol(proc, stdlib, b.symbol()))
                .collect::<pulse_transport::Result<Vec<_>>>()?;
            let streams = (0..stream_count)
                .map(|_| {
                    self.transport
                        .open_stream(proc)
                        .map(|h| Stream::new(self.transport.clone(), h))
                })
                .collect::<pulse_transport::Result<Vec<_>>>()?;
            let proc_id = self.transport.proc_identifier(proc)?;
            Ok(ActiveState { mode, proc, proc_id, stdlib, builtins, streams })
        })();

        let state = match setup {
            Ok(state) => state,
            Err(err) => {
                let _ = self.transport.destroy_process(proc);
                return Err(err);
            }
        };

        self.procs.insert(state.proc_id, self.device_id);
        debug!(
            device = self.device_id,
            proc = state.proc_id,
            ?mode,
            streams = state.streams.len(),
            workers,
            "context initialized"
        );
        *active = Some(state);
        Ok(())
    }

    /// Tear the context down
    ///
    /// Pending allocations are resolved first so nothing lands in freed
    /// table memory; leaks are reported when the runtime was configured to
    /// trace them. Re-`init` afterwards starts from an empty table.
    pub fn destroy(&self) -> Result<()> {
        let mut active = self.active.write();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;

        {
            let table = self.table.lock();
            self.resolve_pending(state, &table)?;
            if self.config.mem_trace {
                for (index, record) in table.iter() {
                    warn!(
                        device = self.device_id,
                        ptr = %VirtualPtr::encode(self.device_id, index, 0),
                        size = record.size(),
                        "allocation was never freed"
                    );
                }
            }
        }

        self.procs.remove(&state.proc_id);
        self.transport.destroy_process(state.proc)?;
        self.modules.lock().clear();
        self.table.lock().clear();
        debug!(device = self.device_id, proc = state.proc_id, "context destroyed");
        *active = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Chase down every record whose address the device has not reported yet
    ///
    /// Size-zero records have no allocation in flight, so their address and
    /// size are queried directly on the default stream; sized records
    /// already carry a pending acknowledgment. Either way the whole context
    /// is synchronized, because the acknowledgment may sit on any stream.
    ///
    /// Callers hold the table lock; the sync happens under it by design,
    /// since nothing may mutate the table while addresses land.
    fn resolve_pending(&self, state: &ActiveState, table: &AllocTable) -> Result<()> {
        let mut needs_sync = false;
        for (index, record) in table.iter() {
            if record.addr_state() == AddrState::Unresolved {
                if record.size() == 0 {
                    let vptr = VirtualPtr::encode(self.device_id, index, 0);
                    let stream = state.stream(0)?;
                    stream.enqueue_call(
                        state.builtin(Builtin::MemPtr),
                        &[vptr.raw().into()],
                        false,
                        ResultDest::Addr(record.addr.clone()),
                    )?;
                    stream.enqueue_call(
                        state.builtin(Builtin::MemSize),
                        &[vptr.raw().into()],
                        false,
                        ResultDest::Size(record.size.clone()),
                    )?;
                }
                needs_sync = true;
            }
        }
        if needs_sync {
            for stream in &state.streams {
                stream.sync()?;
            }
        }
        Ok(())
    }

    fn resolve_inner(
        &self,
        state: &ActiveState,
        ptr: VirtualPtr,
    ) -> Result<(AddrState, u64)> {
        if ptr.device() != self.device_id {
            return Err(Error::InvalidDevice(ptr.device()));
        }
        let table = self.table.lock();
        let record = table.get(ptr.index()).ok_or(Error::UnknownVptr(ptr.raw()))?;
        if record.addr_state() == AddrState::Unresolved {
            self.resolve_pending(state, &table)?;
        }
        match record.addr_state() {
            AddrState::Resolved(addr) => {
                Ok((AddrState::Resolved(addr + ptr.offset()), record.size()))
            }
            // Still nothing: a genuinely zero-sized allocation.
            AddrState::Unresolved => Ok((AddrState::Unresolved, record.size())),
        }
    }

    /// Real device address and allocation size behind a pointer
    ///
    /// Forces a lazy resolution pass when the address is still unknown. The
    /// pointer's byte offset is applied once the address is resolved.
    pub fn resolve(&self, ptr: VirtualPtr) -> Result<(AddrState, u64)> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        self.resolve_inner(state, ptr)
    }

    /// Raw host-visible address for a resolved pointer, the form the
    /// `Raw` fill family consumes
    pub fn raw_ptr(&self, ptr: VirtualPtr) -> Result<u64> {
        match self.resolve(ptr)? {
            (AddrState::Resolved(addr), _) => Ok(addr),
            (AddrState::Unresolved, _) => Err(Error::UninitializedPtr(ptr.raw())),
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes of device memory and return its handle
    /// immediately, before the device-side allocation completes
    pub fn malloc(&self, size: u64, stream: usize) -> Result<VirtualPtr> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        let mut table = self.table.lock();

        // A pending override adopts an existing allocation instead of making
        // a new one; its record must be fully resolved and match the size.
        if table.override_pending() {
            self.resolve_pending(state, &table)?;
        }
        if let Some(ptr) = table.take_override() {
            let record = table.get(ptr.index()).ok_or(Error::UnknownVptr(ptr.raw()))?;
            if record.size() != size {
                return Err(Error::InvalidValue("override size does not match allocation"));
            }
            return match record.addr_state() {
                AddrState::Resolved(_) => Ok(ptr.base()),
                AddrState::Unresolved => Err(Error::UninitializedPtr(ptr.raw())),
            };
        }

        let (index, record) = table.reserve(size).ok_or(Error::OutOfMemory)?;
        let vptr = VirtualPtr::encode(self.device_id, index, 0);

        if size > 0 {
            let stream = state.stream(stream)?;
            stream.enqueue_alloc(size)?;
            stream.enqueue_call(
                state.builtin(Builtin::MemAssign),
                &[vptr.raw().into(), size.into()],
                false,
                ResultDest::Addr(record.addr.clone()),
            )?;
        }

        trace!(device = self.device_id, ptr = %vptr, size, "malloc");
        Ok(vptr)
    }

    /// Allocate pitched memory for a `w_bytes` x `h` region
    ///
    /// The pitch equals the row width; the element size only matters to
    /// transports with stricter row alignment.
    pub fn malloc_pitch(
        &self,
        w_bytes: u64,
        h: u64,
        _elem_size: u32,
        stream: usize,
    ) -> Result<(VirtualPtr, u64)> {
        Ok((self.malloc(w_bytes * h, stream)?, w_bytes))
    }

    /// Free the allocation behind `ptr`
    ///
    /// Inactive contexts ignore frees. When the allocation acknowledgment
    /// has not landed yet the whole context is synchronized first, otherwise
    /// the acknowledgment would write into a record that no longer exists.
    /// That sync runs without the table lock held.
    pub fn free(&self, ptr: VirtualPtr, stream: usize) -> Result<()> {
        let active = self.active.read();
        let Some(state) = active.as_ref() else {
            trace!(ptr = %ptr, "free on inactive context ignored");
            return Ok(());
        };
        if ptr.device() != self.device_id {
            return Err(Error::InvalidDevice(ptr.device()));
        }
        if ptr.offset() != 0 {
            return Err(Error::OffsetNotAllowed(ptr.raw()));
        }

        let ack_pending = {
            let table = self.table.lock();
            let record = table.get(ptr.index()).ok_or(Error::UnknownVptr(ptr.raw()))?;
            record.addr_state() == AddrState::Unresolved && record.size() != 0
        };
        if ack_pending {
            self.sync_all(state)?;
        }

        let record = {
            let mut table = self.table.lock();
            table.remove(ptr.index()).ok_or(Error::UnknownVptr(ptr.raw()))?
        };

        if record.size() > 0 {
            let stream = state.stream(stream)?;
            stream.enqueue_call(
                state.builtin(Builtin::MemRemove),
                &[ptr.raw().into()],
                true,
                ResultDest::Discard,
            )?;
            if let AddrState::Resolved(addr) = record.addr_state() {
                stream.enqueue_free(addr)?;
            }
        }

        trace!(device = self.device_id, ptr = %ptr, "free");
        Ok(())
    }

    /// Adopt `ptr` as the result of the next `malloc` (one-shot), or clear a
    /// pending override with `None`
    pub fn set_override(&self, ptr: Option<VirtualPtr>) -> Result<()> {
        let active = self.active.read();
        active.as_ref().ok_or(Error::ContextDestroyed)?;
        if let Some(ptr) = ptr {
            if ptr.offset() != 0 {
                return Err(Error::OffsetNotAllowed(ptr.raw()));
            }
            if ptr.device() != self.device_id {
                return Err(Error::InvalidDevice(ptr.device()));
            }
        }
        self.table.lock().set_override(ptr);
        Ok(())
    }

    /// Exchange what two base pointers point at, without copying a byte of
    /// device memory
    pub fn swap(&self, a: VirtualPtr, b: VirtualPtr, stream: usize) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        for ptr in [a, b] {
            if ptr.device() != self.device_id {
                return Err(Error::InvalidDevice(ptr.device()));
            }
            if ptr.offset() != 0 {
                return Err(Error::OffsetNotAllowed(ptr.raw()));
            }
        }

        {
            let mut table = self.table.lock();
            table.get(a.index()).ok_or(Error::UnknownVptr(a.raw()))?;
            table.get(b.index()).ok_or(Error::UnknownVptr(b.raw()))?;
            table.swap(a.index(), b.index());
        }

        // Device-side bookkeeping mirrors the exchange.
        state.stream(stream)?.enqueue_call(
            state.builtin(Builtin::MemSwap),
            &[a.raw().into(), b.raw().into()],
            true,
            ResultDest::Discard,
        )?;
        trace!(device = self.device_id, a = %a, b = %b, "swap");
        Ok(())
    }

    /// Base handle and size of the allocation containing `ptr`
    pub fn address_range(&self, ptr: VirtualPtr) -> Result<(VirtualPtr, u64)> {
        let (_, size) = self.resolve(ptr)?;
        Ok((ptr.base(), size))
    }

    /// Free and total device memory, from this context's point of view
    pub fn mem_info(&self) -> Result<(u64, u64)> {
        let total = self.info.memory_size;
        Ok((total.saturating_sub(self.mem_used()?), total))
    }

    /// Bytes currently allocated through this context
    ///
    /// Synchronizes pending resolutions first so adopted and zero-sized
    /// records report their real sizes.
    pub fn mem_used(&self) -> Result<u64> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        let table = self.table.lock();
        self.resolve_pending(state, &table)?;
        Ok(table.iter().map(|(_, record)| record.size()).sum())
    }

    /// Log every live allocation of this context
    pub fn mem_report(&self) -> Result<()> {
        let used = self.mem_used()?;
        info!(
            device = self.device_id,
            used,
            total = self.info.memory_size,
            "device memory"
        );
        let table = self.table.lock();
        for (index, record) in table.iter() {
            info!(
                ptr = %VirtualPtr::encode(self.device_id, index, 0),
                size = record.size(),
                "live allocation"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Copies and fills
    // ------------------------------------------------------------------

    /// Device-to-device copy within this context; no host involvement
    pub fn memcpy_d2d(
        &self,
        dst: VirtualPtr,
        src: VirtualPtr,
        size: u64,
        stream: usize,
    ) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        if dst.is_null() || src.is_null() {
            return Err(Error::InvalidValue("memcpy endpoints must be non-null"));
        }
        state.stream(stream)?.enqueue_call(
            state.builtin(Builtin::MemcpyD2D),
            &[dst.raw().into(), src.raw().into(), size.into()],
            true,
            ResultDest::Discard,
        )?;
        Ok(())
    }

    /// Asynchronous device-to-host read into a staging buffer
    ///
    /// The source is resolved (forcing a sync if needed) and the byte range
    /// bounds-checked against its allocation before anything is enqueued.
    pub fn memcpy_d2h_async(
        &self,
        dst: HostBuffer,
        src: VirtualPtr,
        len: u64,
        stream: usize,
    ) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        if src.is_null() {
            return Err(Error::InvalidValue("memcpy source must be non-null"));
        }
        let addr = self.checked_endpoint(state, src, len)?;
        state.stream(stream)?.enqueue_read(dst, addr, len)?;
        Ok(())
    }

    /// Synchronous device-to-host copy into `dst`
    pub fn memcpy_d2h(&self, dst: &mut [u8], src: VirtualPtr, stream: usize) -> Result<()> {
        let staging = HostBuffer::new(dst.len());
        self.memcpy_d2h_async(staging.clone(), src, dst.len() as u64, stream)?;
        self.sync_stream(stream)?;
        staging.read_into(dst);
        Ok(())
    }

    /// Asynchronous host-to-device write; `src` is captured at enqueue time
    pub fn memcpy_h2d_async(
        &self,
        dst: VirtualPtr,
        src: &[u8],
        stream: usize,
    ) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        if dst.is_null() {
            return Err(Error::InvalidValue("memcpy destination must be non-null"));
        }
        let addr = self.checked_endpoint(state, dst, src.len() as u64)?;
        state.stream(stream)?.enqueue_write(addr, src)?;
        Ok(())
    }

    /// Synchronous host-to-device copy
    pub fn memcpy_h2d(&self, dst: VirtualPtr, src: &[u8], stream: usize) -> Result<()> {
        self.memcpy_h2d_async(dst, src, stream)?;
        self.sync_stream(stream)
    }

    /// Resolve a transfer endpoint and validate the requested range
    fn checked_endpoint(
        &self,
        state: &ActiveState,
        ptr: VirtualPtr,
        len: u64,
    ) -> Result<u64> {
        let (addr_state, size) = self.resolve_inner(state, ptr)?;
        let AddrState::Resolved(addr) = addr_state else {
            return Err(Error::UninitializedPtr(ptr.raw()));
        };
        if size == 0 {
            return Err(Error::UninitializedPtr(ptr.raw()));
        }
        if ptr.offset() + len > size {
            return Err(Error::OutOfBounds { offset: ptr.offset(), len, size });
        }
        Ok(addr)
    }

    fn fill(
        &self,
        dst: FillDst,
        width: FillWidth,
        two_d: bool,
        args: &[CallArg],
        stream: usize,
    ) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        let builtin = Builtin::fill(dst.is_raw(), width, two_d);
        let mut call: Vec<CallArg> = Vec::with_capacity(args.len() + 1);
        call.push(dst.wire().into());
        call.extend_from_slice(args);
        state
            .stream(stream)?
            .enqueue_call(state.builtin(builtin), &call, true, ResultDest::Discard)?;
        Ok(())
    }

    /// Fill `count` 8-bit values
    pub fn memset_u8(&self, dst: FillDst, value: u8, count: u64, stream: usize) -> Result<()> {
        self.fill(dst, FillWidth::U8, false, &[value.into(), count.into()], stream)
    }

    /// Fill `count` 16-bit values
    pub fn memset_u16(&self, dst: FillDst, value: u16, count: u64, stream: usize) -> Result<()> {
        self.fill(dst, FillWidth::U16, false, &[value.into(), count.into()], stream)
    }

    /// Fill `count` 32-bit values
    pub fn memset_u32(&self, dst: FillDst, value: u32, count: u64, stream: usize) -> Result<()> {
        self.fill(dst, FillWidth::U32, false, &[value.into(), count.into()], stream)
    }

    /// Fill `count` 64-bit values
    pub fn memset_u64(&self, dst: FillDst, value: u64, count: u64, stream: usize) -> Result<()> {
        self.fill(dst, FillWidth::U64, false, &[value.into(), count.into()], stream)
    }

    /// Fill `count` 128-bit values given as an (x, y) pair of words
    pub fn memset_u128(
        &self,
        dst: FillDst,
        x: u64,
        y: u64,
        count: u64,
        stream: usize,
    ) -> Result<()> {
        self.fill(
            dst,
            FillWidth::U128,
            false,
            &[x.into(), y.into(), count.into()],
            stream,
        )
    }

    /// Fill a pitched 2-D region of 8-bit values, `w` elements per row
    pub fn memset2d_u8(
        &self,
        dst: FillDst,
        pitch: u64,
        value: u8,
        w: u64,
        h: u64,
        stream: usize,
    ) -> Result<()> {
        self.fill(
            dst,
            FillWidth::U8,
            true,
            &[pitch.into(), value.into(), w.into(), h.into()],
            stream,
        )
    }

    /// Fill a pitched 2-D region of 16-bit values
    pub fn memset2d_u16(
        &self,
        dst: FillDst,
        pitch: u64,
        value: u16,
        w: u64,
        h: u64,
        stream: usize,
    ) -> Result<()> {
        self.fill(
            dst,
            FillWidth::U16,
            true,
            &[pitch.into(), value.into(), w.into(), h.into()],
            stream,
        )
    }

    /// Fill a pitched 2-D region of 32-bit values
    pub fn memset2d_u32(
        &self,
        dst: FillDst,
        pitch: u64,
        value: u32,
        w: u64,
        h: u64,
        stream: usize,
    ) -> Result<()> {
        self.fill(
            dst,
            FillWidth::U32,
            true,
            &[pitch.into(), value.into(), w.into(), h.into()],
            stream,
        )
    }

    /// Fill a pitched 2-D region of 64-bit values
    pub fn memset2d_u64(
        &self,
        dst: FillDst,
        pitch: u64,
        value: u64,
        w: u64,
        h: u64,
        stream: usize,
    ) -> Result<()> {
        self.fill(
            dst,
            FillWidth::U64,
            true,
            &[pitch.into(), value.into(), w.into(), h.into()],
            stream,
        )
    }

    /// Fill a pitched 2-D region of 128-bit values
    #[allow(clippy::too_many_arguments)]
    pub fn memset2d_u128(
        &self,
        dst: FillDst,
        pitch: u64,
        x: u64,
        y: u64,
        w: u64,
        h: u64,
        stream: usize,
    ) -> Result<()> {
        self.fill(
            dst,
            FillWidth::U128,
            true,
            &[pitch.into(), x.into(), y.into(), w.into(), h.into()],
            stream,
        )
    }

    // ------------------------------------------------------------------
    // Modules and calls
    // ------------------------------------------------------------------

    /// Load a module into the offload process
    pub fn module_load(&self, name: &str) -> Result<ModuleHandle> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        if name.is_empty() {
            return Err(Error::InvalidValue("module name must not be empty"));
        }
        let handle = self
            .transport
            .load_module(state.proc, name)
            .map_err(|_| Error::ModuleNotFound(name.to_string()))?;
        self.modules
            .lock()
            .insert(handle.0, Module { handle, name: name.to_string() });
        debug!(device = self.device_id, name, "module loaded");
        Ok(handle)
    }

    /// Unload a previously loaded module
    pub fn module_unload(&self, module: ModuleHandle) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        self.transport.unload_module(state.proc, module)?;
        self.modules.lock().remove(&module.0);
        Ok(())
    }

    /// Resolve a function from a loaded module
    pub fn module_function(&self, module: ModuleHandle, name: &str) -> Result<FuncHandle> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        if name.is_empty() {
            return Err(Error::InvalidValue("function name must not be empty"));
        }
        self.transport
            .resolve_symbol(state.proc, module, name)
            .map_err(|_| Error::FunctionNotFound(name.to_string()))
    }

    /// Enqueue a call to a resolved function
    ///
    /// With `check` set the raw result is interpreted as a status code at
    /// sync time; `result` receives the raw value either way.
    pub fn call(
        &self,
        func: FuncHandle,
        args: &[CallArg],
        stream: usize,
        check: bool,
        result: Option<Arc<CallSlot>>,
    ) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        let dest = match result {
            Some(slot) => ResultDest::Value(slot),
            None => ResultDest::Discard,
        };
        state.stream(stream)?.enqueue_call(func, args, check, dest)
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    fn sync_all(&self, state: &ActiveState) -> Result<()> {
        for stream in &state.streams {
            stream.sync()?;
        }
        Ok(())
    }

    /// Drain every stream of this context
    pub fn sync(&self) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        self.sync_all(state)
    }

    /// Drain one stream
    pub fn sync_stream(&self, stream: usize) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        state.stream(stream)?.sync()
    }

    /// Advisory stream-state probe
    ///
    /// `Ok(())` when the stream has drained; otherwise the error variant
    /// naming its current state. Not a substitute for [`Context::sync`].
    pub fn query(&self, stream: usize) -> Result<()> {
        let active = self.active.read();
        let state = active.as_ref().ok_or(Error::ContextDestroyed)?;
        match state.stream(stream)?.state() {
            StreamState::Exited => Ok(()),
            StreamState::Running => Err(Error::StreamRunning),
            StreamState::Syscall => Err(Error::StreamSyscall),
            StreamState::Blocked => Err(Error::StreamBlocked),
            StreamState::Unknown => Err(Error::StreamUnknown),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device_id)
            .field("active", &self.is_active())
            .finish()
    }
}
