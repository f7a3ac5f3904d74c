//! Execution streams with deferred result resolution
//!
//! A [`Stream`] issues calls to the transport immediately but observes their
//! results lazily: every submission appends a pending record, and
//! [`Stream::sync`] drains those records strictly in issue order, writing raw
//! results into their destinations. Destinations are shared cells so that a
//! result can land in an allocation record without going back through the
//! table lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::trace;

use pulse_transport::{
    status, CallArg, FuncHandle, HostBuffer, RequestId, StreamHandle, StreamState, Transport,
};

use crate::error::{Error, Result};

/// Resolution state of an allocation's device address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrState {
    /// The backing allocation has not reported its address yet
    Unresolved,
    /// The real device address
    Resolved(u64),
}

/// Write-once holder for a deferred device address
///
/// Created unresolved alongside the allocation record; filled exactly once,
/// either by the allocation acknowledgment or by a lazy device query.
#[derive(Debug, Default)]
pub struct AddrCell {
    inner: OnceLock<u64>,
}

impl AddrCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current resolution state
    pub fn state(&self) -> AddrState {
        match self.inner.get() {
            Some(&addr) => AddrState::Resolved(addr),
            None => AddrState::Unresolved,
        }
    }

    /// Accept a raw result from the device
    ///
    /// Zero means the device had nothing to report (the paired allocation
    /// never landed); the cell stays unresolved in that case.
    pub fn fill(&self, raw: u64) {
        if raw != 0 {
            let _ = self.inner.set(raw);
        }
    }
}

/// Byte-size holder shared between an allocation record and lazy queries
///
/// Initialized to the requested size; a device-side size query overwrites it
/// for records whose allocation happened outside the host's control.
#[derive(Debug, Default)]
pub struct SizeCell(AtomicU64);

impl SizeCell {
    pub fn new(size: u64) -> Self {
        Self(AtomicU64::new(size))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, size: u64) {
        self.0.store(size, Ordering::Release);
    }
}

/// Caller-visible slot for the raw result of one call
#[derive(Debug, Default)]
pub struct CallSlot(AtomicU64);

impl CallSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, raw: u64) {
        self.0.store(raw, Ordering::Release);
    }
}

/// Where a pending call's raw result goes at sync time
#[derive(Debug, Clone)]
pub enum ResultDest {
    /// Result is not interesting
    Discard,
    /// Fill a deferred allocation address
    Addr(Arc<AddrCell>),
    /// Overwrite an allocation size
    Size(Arc<SizeCell>),
    /// Hand the raw value to the caller
    Value(Arc<CallSlot>),
}

#[derive(Debug)]
struct Pending {
    req: RequestId,
    check: bool,
    dest: ResultDest,
}

/// One ordered asynchronous call queue against a device execution unit
///
/// Streams are not internally serialized against concurrent submitters; one
/// thread per stream, or external serialization, is the caller's contract.
/// The pending list has its own lock so `sync` never races a submission on
/// another stream of the same context.
pub struct Stream {
    transport: Arc<dyn Transport>,
    handle: StreamHandle,
    pending: Mutex<Vec<Pending>>,
}

impl Stream {
    pub fn new(transport: Arc<dyn Transport>, handle: StreamHandle) -> Self {
        Self {
            transport,
            handle,
            pending: Mutex::new(Vec::with_capacity(128)),
        }
    }

    fn push(&self, req: RequestId, check: bool, dest: ResultDest) {
        trace!(stream = self.handle.0, req, check, "enqueued");
        self.pending.lock().push(Pending { req, check, dest });
    }

    /// Issue a device-side function call; never blocks
    pub fn enqueue_call(
        &self,
        func: FuncHandle,
        args: &[CallArg],
        check: bool,
        dest: ResultDest,
    ) -> Result<()> {
        let req = self.transport.enqueue_call(self.handle, func, args)?;
        self.push(req, check, dest);
        Ok(())
    }

    /// Issue an anonymous device allocation
    pub fn enqueue_alloc(&self, size: u64) -> Result<()> {
        let req = self.transport.enqueue_alloc(self.handle, size)?;
        self.push(req, false, ResultDest::Discard);
        Ok(())
    }

    /// Issue a free of a raw device address
    pub fn enqueue_free(&self, addr: u64) -> Result<()> {
        let req = self.transport.enqueue_free(self.handle, addr)?;
        self.push(req, false, ResultDest::Discard);
        Ok(())
    }

    /// Issue a device-to-host read into a staging buffer
    pub fn enqueue_read(&self, dst: HostBuffer, src: u64, len: u64) -> Result<()> {
        let req = self.transport.enqueue_read(self.handle, dst, src, len)?;
        self.push(req, false, ResultDest::Discard);
        Ok(())
    }

    /// Issue a host-to-device write; the bytes are captured immediately
    pub fn enqueue_write(&self, dst: u64, src: &[u8]) -> Result<()> {
        let req = self.transport.enqueue_write(self.handle, dst, src)?;
        self.push(req, false, ResultDest::Discard);
        Ok(())
    }

    /// Drain the pending queue in issue order
    ///
    /// Every entry is waited on, even the ones after a failure; later entries
    /// may depend on earlier side effects, and abandoning them would leave
    /// the queue inconsistent. The first failure wins; callers needing
    /// per-call outcomes pass [`ResultDest::Value`] slots.
    pub fn sync(&self) -> Result<()> {
        let drained: Vec<Pending> = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return Ok(());
        }
        trace!(stream = self.handle.0, calls = drained.len(), "sync");

        let mut first_err: Option<Error> = None;
        for entry in drained {
            let raw = match self.transport.wait_result(self.handle, entry.req) {
                Ok(raw) => raw,
                Err(err) => {
                    first_err.get_or_insert(err.into());
                    continue;
                }
            };
            match &entry.dest {
                ResultDest::Discard => {}
                ResultDest::Addr(cell) => cell.fill(raw),
                ResultDest::Size(cell) => cell.set(raw),
                ResultDest::Value(slot) => slot.set(raw),
            }
            if entry.check && raw != status::OK {
                first_err.get_or_insert(Error::from_device_status(raw));
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of calls waiting for the next sync
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Best-effort execution-state snapshot; advisory, not a sync substitute
    pub fn state(&self) -> StreamState {
        self.transport.stream_state(self.handle)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("pending", &self.pending_calls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_transport::EmulatedTransport;

    fn stream() -> Stream {
        let transport = Arc::new(EmulatedTransport::new(1));
        let proc = transport.create_process(0, 1).unwrap();
        let handle = transport.open_stream(proc).unwrap();
        Stream::new(transport, handle)
    }

    #[test]
    fn test_sync_clears_pending() {
        let s = stream();
        s.enqueue_alloc(64).unwrap();
        s.enqueue_alloc(64).unwrap();
        assert_eq!(s.pending_calls(), 2);
        s.sync().unwrap();
        assert_eq!(s.pending_calls(), 0);
        // Nothing left to re-wait.
        s.sync().unwrap();
    }

    #[test]
    fn test_addr_cell_ignores_null() {
        let cell = AddrCell::new();
        cell.fill(0);
        assert_eq!(cell.state(), AddrState::Unresolved);
        cell.fill(0x7000);
        assert_eq!(cell.state(), AddrState::Resolved(0x7000));
        // Write-once: a second fill does not displace the address.
        cell.fill(0x9000);
        assert_eq!(cell.state(), AddrState::Resolved(0x7000));
    }
}
