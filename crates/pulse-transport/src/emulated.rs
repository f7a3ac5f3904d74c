//! In-process software transport
//!
//! Executes the full transport contract against emulated device memory, with
//! the same observable semantics as a hardware transport: requests complete
//! in submission order per stream, allocation is two-phased (an anonymous
//! device allocation later claimed by `mem_assign`), and results are only
//! visible through `wait_result`.
//!
//! Requests are executed eagerly at submission time. That is legal because
//! the contract never promises *when* a request runs, only that results
//! become observable in FIFO order per stream.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::device_info::DeviceInfo;
use crate::error::{Error, Result};
use crate::layout;
use crate::traits::{
    status, CallArg, FuncHandle, HostBuffer, ModuleHandle, ProcHandle, ProcId, RequestId,
    StreamHandle, StreamState, Transport,
};

/// Device-side helper routines of the standard module
///
/// The `raw_*` family operates on raw host-visible addresses instead of
/// virtual pointers.
const BUILTIN_SYMBOLS: &[&str] = &[
    "pulse_mem_assign",
    "pulse_mem_remove",
    "pulse_mem_ptr",
    "pulse_mem_size",
    "pulse_mem_swap",
    "pulse_memcpy_d2d",
    "pulse_memset_u8",
    "pulse_memset_u16",
    "pulse_memset_u32",
    "pulse_memset_u64",
    "pulse_memset_u128",
    "pulse_memset_u8_2d",
    "pulse_memset_u16_2d",
    "pulse_memset_u32_2d",
    "pulse_memset_u64_2d",
    "pulse_memset_u128_2d",
    "pulse_raw_memcpy_d2d",
    "pulse_raw_memset_u8",
    "pulse_raw_memset_u16",
    "pulse_raw_memset_u32",
    "pulse_raw_memset_u64",
    "pulse_raw_memset_u128",
    "pulse_raw_memset_u8_2d",
    "pulse_raw_memset_u16_2d",
    "pulse_raw_memset_u32_2d",
    "pulse_raw_memset_u64_2d",
    "pulse_raw_memset_u128_2d",
];

/// Builtin function handles carry this tag in the upper bits so they can
/// never collide with user-module handles.
const BUILTIN_TAG: u64 = 0xB << 60;

/// First raw device address handed out by the emulated allocator. Nonzero so
/// that address 0 keeps meaning "unresolved" end to end.
const HEAP_BASE: u64 = 0x6000_0000_0000;

#[derive(Debug, Clone, Copy)]
struct DirEntry {
    addr: u64,
    size: u64,
}

/// One emulated offload process: its heap, module table and the device-side
/// pointer directory maintained by the `mem_*` helpers.
struct Proc {
    ordinal: usize,
    id: ProcId,
    #[allow(dead_code)]
    workers: usize,
    streams: Vec<StreamHandle>,
    modules: HashMap<u64, String>,
    /// Raw allocations, keyed by base address
    heap: BTreeMap<u64, Vec<u8>>,
    next_addr: u64,
    /// Anonymous allocations not yet claimed by `mem_assign`, oldest first
    unbound: VecDeque<u64>,
    /// Device-side map from virtual-pointer base to its backing allocation
    directory: HashMap<u64, DirEntry>,
}

impl Proc {
    /// Mutable view of `len` bytes at `addr`, which may point into the
    /// middle of an allocation.
    fn heap_range(&mut self, addr: u64, len: u64) -> Option<&mut [u8]> {
        let (&base, block) = self.heap.range_mut(..=addr).next_back()?;
        let start = (addr - base) as usize;
        let end = start.checked_add(len as usize)?;
        block.get_mut(start..end)
    }

    fn resolve_vptr(&self, vptr: u64) -> Option<(u64, u64)> {
        let entry = self.directory.get(&layout::base(vptr))?;
        Some((entry.addr + layout::offset(vptr), entry.size))
    }
}

struct StreamData {
    proc: ProcHandle,
    results: HashMap<RequestId, u64>,
    next_req: RequestId,
    /// Requests submitted but not yet waited on
    outstanding: usize,
}

/// Software device implementing [`Transport`] entirely in process memory
///
/// The development and test backend. One instance emulates a fixed number of
/// devices; each created process gets its own heap and pointer directory, so
/// independent runtimes never observe each other.
pub struct EmulatedTransport {
    devices: Vec<DeviceInfo>,
    procs: DashMap<u64, Mutex<Proc>>,
    streams: DashMap<u64, Mutex<StreamData>>,
    next_handle: AtomicU64,
    next_proc_id: AtomicU32,
    /// Test hook: number of upcoming device allocations to drop on the floor
    fail_allocs: AtomicU32,
}

impl EmulatedTransport {
    /// Create a transport emulating `device_count` devices
    pub fn new(device_count: usize) -> Self {
        Self {
            devices: (0..device_count).map(DeviceInfo::emulated).collect(),
            procs: DashMap::new(),
            streams: DashMap::new(),
            next_handle: AtomicU64::new(1),
            next_proc_id: AtomicU32::new(1),
            fail_allocs: AtomicU32::new(0),
        }
    }

    /// Make the next `n` device allocations fail silently, as a hardware
    /// device would when its memory is exhausted mid-stream
    pub fn fail_next_allocs(&self, n: u32) {
        self.fail_allocs.store(n, Ordering::SeqCst);
    }

    fn fresh_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn builtin_index(func: FuncHandle) -> Option<usize> {
        if func.0 & BUILTIN_TAG == BUILTIN_TAG {
            Some((func.0 & !BUILTIN_TAG) as usize)
        } else {
            None
        }
    }

    /// Execute one builtin against the owning process and return the raw
    /// result that `wait_result` will report.
    fn execute(&self, proc: &mut Proc, func: FuncHandle, args: &[u64]) -> u64 {
        let Some(idx) = Self::builtin_index(func) else {
            return status::INVALID_ARGS;
        };
        let name = BUILTIN_SYMBOLS[idx];
        trace!(func = name, ?args, "execute builtin");

        match name {
            "pulse_mem_assign" => {
                let (vptr, size) = (args[0], args[1]);
                match proc.unbound.pop_front() {
                    Some(addr) => {
                        proc.directory.insert(layout::base(vptr), DirEntry { addr, size });
                        addr
                    }
                    // Nothing arrived from the paired allocation; the host
                    // record stays unresolved.
                    None => 0,
                }
            }
            "pulse_mem_remove" => match proc.directory.remove(&layout::base(args[0])) {
                Some(_) => status::OK,
                None => status::UNKNOWN_VPTR,
            },
            "pulse_mem_ptr" => proc.resolve_vptr(args[0]).map_or(0, |(addr, _)| addr),
            "pulse_mem_size" => proc.resolve_vptr(args[0]).map_or(0, |(_, size)| size),
            "pulse_mem_swap" => {
                let (a, b) = (layout::base(args[0]), layout::base(args[1]));
                match (proc.directory.get(&a).copied(), proc.directory.get(&b).copied()) {
                    (Some(ea), Some(eb)) => {
                        proc.directory.insert(a, eb);
                        proc.directory.insert(b, ea);
                        status::OK
                    }
                    _ => status::UNKNOWN_VPTR,
                }
            }
            "pulse_memcpy_d2d" => {
                let (Some((dst, _)), Some((src, _))) =
                    (proc.resolve_vptr(args[0]), proc.resolve_vptr(args[1]))
                else {
                    return status::UNKNOWN_VPTR;
                };
                self.copy_range(proc, dst, src, args[2])
            }
            "pulse_raw_memcpy_d2d" => self.copy_range(proc, args[0], args[1], args[2]),
            _ => {
                let raw = name.starts_with("pulse_raw_");
                let dst = if raw {
                    args[0]
                } else {
                    match proc.resolve_vptr(args[0]) {
                        Some((addr, _)) => addr,
                        None => return status::UNKNOWN_VPTR,
                    }
                };
                self.fill(proc, name, dst, &args[1..])
            }
        }
    }

    fn copy_range(&self, proc: &mut Proc, dst: u64, src: u64, len: u64) -> u64 {
        let Some(bytes) = proc.heap_range(src, len).map(|s| s.to_vec()) else {
            return status::INVALID_ARGS;
        };
        match proc.heap_range(dst, len) {
            Some(out) => {
                out.copy_from_slice(&bytes);
                status::OK
            }
            None => status::INVALID_ARGS,
        }
    }

    /// Dispatch the memset family. `rest` is the argument tail after the
    /// destination: `[value.., count]` for 1-D, `[pitch, value.., w, h]` for
    /// 2-D, with 128-bit patterns carrying two value words.
    fn fill(&self, proc: &mut Proc, name: &str, dst: u64, rest: &[u64]) -> u64 {
        let two_d = name.ends_with("_2d");
        let stem = name.trim_end_matches("_2d");
        let (width, pattern): (usize, Vec<u8>) = match stem {
            s if s.ends_with("u8") => (1, vec![rest[two_d as usize] as u8]),
            s if s.ends_with("u16") => {
                (2, (rest[two_d as usize] as u16).to_le_bytes().to_vec())
            }
            s if s.ends_with("u32") => {
                (4, (rest[two_d as usize] as u32).to_le_bytes().to_vec())
            }
            s if s.ends_with("u64") => (8, rest[two_d as usize].to_le_bytes().to_vec()),
            s if s.ends_with("u128") => {
                let base = two_d as usize;
                let mut p = rest[base].to_le_bytes().to_vec();
                p.extend_from_slice(&rest[base + 1].to_le_bytes());
                (16, p)
            }
            _ => return status::INVALID_ARGS,
        };

        let value_words = if width == 16 { 2 } else { 1 };
        if two_d {
            let pitch = rest[0];
            let w = rest[1 + value_words];
            let h = rest[2 + value_words];
            for row in 0..h {
                if self.fill_row(proc, dst + row * pitch, &pattern, w) != status::OK {
                    return status::INVALID_ARGS;
                }
            }
            status::OK
        } else {
            let count = rest[value_words];
            self.fill_row(proc, dst, &pattern, count)
        }
    }

    fn fill_row(&self, proc: &mut Proc, dst: u64, pattern: &[u8], count: u64) -> u64 {
        let len = pattern.len() as u64 * count;
        match proc.heap_range(dst, len) {
            Some(out) => {
                for chunk in out.chunks_exact_mut(pattern.len()) {
                    chunk.copy_from_slice(pattern);
                }
                status::OK
            }
            None => status::INVALID_ARGS,
        }
    }

    /// Record a completed request on its stream and hand back its id
    fn complete(&self, stream: StreamHandle, result: u64) -> Result<RequestId> {
        let data = self.streams.get(&stream.0).ok_or(Error::UnknownStream(stream.0))?;
        let mut data = data.lock();
        let req = data.next_req;
        data.next_req += 1;
        data.outstanding += 1;
        data.results.insert(req, result);
        Ok(req)
    }

    fn with_proc_of<T>(
        &self,
        stream: StreamHandle,
        f: impl FnOnce(&mut Proc) -> T,
    ) -> Result<T> {
        let proc_handle = {
            let data = self.streams.get(&stream.0).ok_or(Error::UnknownStream(stream.0))?;
            let data = data.lock();
            data.proc
        };
        let proc = self
            .procs
            .get(&proc_handle.0)
            .ok_or(Error::UnknownProcess(proc_handle.0))?;
        let mut proc = proc.lock();
        Ok(f(&mut proc))
    }
}

impl Transport for EmulatedTransport {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, ordinal: usize) -> Result<DeviceInfo> {
        self.devices
            .get(ordinal)
            .cloned()
            .ok_or_else(|| Error::process_create(ordinal, "no such device"))
    }

    fn create_process(&self, ordinal: usize, workers: usize) -> Result<ProcHandle> {
        if ordinal >= self.devices.len() {
            return Err(Error::process_create(ordinal, "no such device"));
        }
        let handle = ProcHandle(self.fresh_handle());
        let id = self.next_proc_id.fetch_add(1, Ordering::SeqCst);
        self.procs.insert(
            handle.0,
            Mutex::new(Proc {
                ordinal,
                id,
                workers,
                streams: Vec::new(),
                modules: HashMap::new(),
                heap: BTreeMap::new(),
                next_addr: HEAP_BASE,
                unbound: VecDeque::new(),
                directory: HashMap::new(),
            }),
        );
        debug!(ordinal, proc = id, workers, "created emulated process");
        Ok(handle)
    }

    fn destroy_process(&self, proc: ProcHandle) -> Result<()> {
        let (_, entry) = self.procs.remove(&proc.0).ok_or(Error::UnknownProcess(proc.0))?;
        let inner = entry.into_inner();
        for stream in &inner.streams {
            self.streams.remove(&stream.0);
        }
        debug!(proc = inner.id, "destroyed emulated process");
        Ok(())
    }

    fn proc_identifier(&self, proc: ProcHandle) -> Result<ProcId> {
        let entry = self.procs.get(&proc.0).ok_or(Error::UnknownProcess(proc.0))?;
        let id = entry.lock().id;
        Ok(id)
    }

    fn open_stream(&self, proc: ProcHandle) -> Result<StreamHandle> {
        let entry = self.procs.get(&proc.0).ok_or(Error::UnknownProcess(proc.0))?;
        let handle = StreamHandle(self.fresh_handle());
        entry.lock().streams.push(handle);
        self.streams.insert(
            handle.0,
            Mutex::new(StreamData {
                proc,
                results: HashMap::new(),
                next_req: 1,
                outstanding: 0,
            }),
        );
        Ok(handle)
    }

    fn load_module(&self, proc: ProcHandle, name: &str) -> Result<ModuleHandle> {
        if name.is_empty() {
            return Err(Error::ModuleNotFound(name.into()));
        }
        let entry = self.procs.get(&proc.0).ok_or(Error::UnknownProcess(proc.0))?;
        let handle = ModuleHandle(self.fresh_handle());
        entry.lock().modules.insert(handle.0, name.to_string());
        Ok(handle)
    }

    fn unload_module(&self, proc: ProcHandle, module: ModuleHandle) -> Result<()> {
        let entry = self.procs.get(&proc.0).ok_or(Error::UnknownProcess(proc.0))?;
        entry.lock().modules.remove(&module.0);
        Ok(())
    }

    fn resolve_symbol(
        &self,
        proc: ProcHandle,
        _module: ModuleHandle,
        name: &str,
    ) -> Result<FuncHandle> {
        if !self.procs.contains_key(&proc.0) {
            return Err(Error::UnknownProcess(proc.0));
        }
        BUILTIN_SYMBOLS
            .iter()
            .position(|&s| s == name)
            .map(|idx| FuncHandle(BUILTIN_TAG | idx as u64))
            .ok_or_else(|| Error::SymbolNotFound(name.into()))
    }

    fn enqueue_call(
        &self,
        stream: StreamHandle,
        func: FuncHandle,
        args: &[CallArg],
    ) -> Result<RequestId> {
        let raw: Vec<u64> = args.iter().map(CallArg::widen).collect();
        let result = self.with_proc_of(stream, |proc| self.execute(proc, func, &raw))?;
        self.complete(stream, result)
    }

    fn enqueue_alloc(&self, stream: StreamHandle, size: u64) -> Result<RequestId> {
        let failed = self
            .fail_allocs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = self.with_proc_of(stream, |proc| {
            if failed {
                return status::OUT_OF_MEMORY;
            }
            let addr = proc.next_addr;
            proc.next_addr += size.max(1).next_multiple_of(8);
            proc.heap.insert(addr, vec![0u8; size as usize]);
            proc.unbound.push_back(addr);
            status::OK
        })?;
        self.complete(stream, result)
    }

    fn enqueue_free(&self, stream: StreamHandle, addr: u64) -> Result<RequestId> {
        let result = self.with_proc_of(stream, |proc| match proc.heap.remove(&addr) {
            Some(_) => status::OK,
            None => status::INVALID_ARGS,
        })?;
        self.complete(stream, result)
    }

    fn enqueue_read(
        &self,
        stream: StreamHandle,
        dst: HostBuffer,
        src: u64,
        len: u64,
    ) -> Result<RequestId> {
        let result = self.with_proc_of(stream, |proc| match proc.heap_range(src, len) {
            Some(bytes) => {
                dst.write_from(bytes);
                status::OK
            }
            None => status::INVALID_ARGS,
        })?;
        self.complete(stream, result)
    }

    fn enqueue_write(&self, stream: StreamHandle, dst: u64, src: &[u8]) -> Result<RequestId> {
        let result =
            self.with_proc_of(stream, |proc| match proc.heap_range(dst, src.len() as u64) {
                Some(out) => {
                    out.copy_from_slice(src);
                    status::OK
                }
                None => status::INVALID_ARGS,
            })?;
        self.complete(stream, result)
    }

    fn wait_result(&self, stream: StreamHandle, req: RequestId) -> Result<u64> {
        let data = self.streams.get(&stream.0).ok_or(Error::UnknownStream(stream.0))?;
        let mut data = data.lock();
        let result = data.results.remove(&req).ok_or(Error::UnknownRequest(req))?;
        data.outstanding -= 1;
        Ok(result)
    }

    fn stream_state(&self, stream: StreamHandle) -> StreamState {
        match self.streams.get(&stream.0) {
            Some(data) => {
                if data.lock().outstanding > 0 {
                    StreamState::Running
                } else {
                    StreamState::Exited
                }
            }
            None => StreamState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (EmulatedTransport, ProcHandle, StreamHandle) {
        let t = EmulatedTransport::new(1);
        let proc = t.create_process(0, 2).unwrap();
        let stream = t.open_stream(proc).unwrap();
        (t, proc, stream)
    }

    fn builtin(t: &EmulatedTransport, proc: ProcHandle, name: &str) -> FuncHandle {
        let module = t.load_module(proc, "libpulse.vso").unwrap();
        t.resolve_symbol(proc, module, name).unwrap()
    }

    #[test]
    fn test_two_phase_alloc_binds_in_order() {
        let (t, proc, stream) = setup();
        let assign = builtin(&t, proc, "pulse_mem_assign");

        let vptr_a = 1u64 << layout::OFFSET_BITS;
        let vptr_b = 2u64 << layout::OFFSET_BITS;

        t.enqueue_alloc(stream, 64).unwrap();
        t.enqueue_alloc(stream, 128).unwrap();
        let ra = t
            .enqueue_call(stream, assign, &[vptr_a.into(), 64u64.into()])
            .unwrap();
        let rb = t
            .enqueue_call(stream, assign, &[vptr_b.into(), 128u64.into()])
            .unwrap();

        let addr_a = t.wait_result(stream, ra).unwrap();
        let addr_b = t.wait_result(stream, rb).unwrap();
        assert_ne!(addr_a, 0);
        assert_ne!(addr_b, 0);
        assert!(addr_b > addr_a, "oldest unbound allocation is claimed first");
    }

    #[test]
    fn test_assign_without_alloc_reports_null() {
        let (t, proc, stream) = setup();
        let assign = builtin(&t, proc, "pulse_mem_assign");
        let req = t
            .enqueue_call(stream, assign, &[(1u64 << layout::OFFSET_BITS).into(), 8u64.into()])
            .unwrap();
        assert_eq!(t.wait_result(stream, req).unwrap(), 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (t, proc, stream) = setup();
        let assign = builtin(&t, proc, "pulse_mem_assign");
        let vptr = 7u64 << layout::OFFSET_BITS;

        t.enqueue_alloc(stream, 16).unwrap();
        let req = t
            .enqueue_call(stream, assign, &[vptr.into(), 16u64.into()])
            .unwrap();
        let addr = t.wait_result(stream, req).unwrap();

        t.enqueue_write(stream, addr, b"offload-payload!").unwrap();
        let buf = HostBuffer::new(16);
        t.enqueue_read(stream, buf.clone(), addr, 16).unwrap();
        assert_eq!(buf.to_vec(), b"offload-payload!");
    }

    #[test]
    fn test_stream_state_tracks_outstanding() {
        let (t, _proc, stream) = setup();
        assert_eq!(t.stream_state(stream), StreamState::Exited);
        let req = t.enqueue_alloc(stream, 8).unwrap();
        assert_eq!(t.stream_state(stream), StreamState::Running);
        t.wait_result(stream, req).unwrap();
        assert_eq!(t.stream_state(stream), StreamState::Exited);
    }

    #[test]
    fn test_processes_are_isolated() {
        let t = EmulatedTransport::new(2);
        let p0 = t.create_process(0, 1).unwrap();
        let p1 = t.create_process(1, 1).unwrap();
        assert_ne!(t.proc_identifier(p0).unwrap(), t.proc_identifier(p1).unwrap());

        t.destroy_process(p0).unwrap();
        assert!(t.proc_identifier(p0).is_err());
        assert!(t.proc_identifier(p1).is_ok());
    }
}
