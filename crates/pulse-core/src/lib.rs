//! Context, stream and virtual-pointer core of the pulse offload runtime
//!
//! This crate virtualizes an accelerator device on the host side:
//! - Per-device execution contexts with a strict init/destroy lifecycle
//! - Asynchronous execution streams with deferred result resolution
//! - A virtual device-pointer address space layered over the transport
//!
//! # Architecture
//!
//! The design follows these principles:
//! 1. **Handles, not addresses**: callers hold [`VirtualPtr`] values whose
//!    backing device address may not be known yet; resolution is lazy and
//!    forced only when an operation needs the real address
//! 2. **Caller-driven asynchrony**: every operation enqueues onto a stream
//!    and returns; completion is observed through `sync`, in FIFO order
//! 3. **Typed failure**: internal errors propagate as [`Error`] values and
//!    never cross a public boundary as a panic
//! 4. **Explicit registry**: per-thread current-context state lives in an
//!    owned [`Runtime`], not in ambient globals
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pulse_core::{ContextMode, Runtime};
//! use pulse_transport::EmulatedTransport;
//!
//! # fn main() -> Result<(), pulse_core::Error> {
//! let runtime = Runtime::new(Arc::new(EmulatedTransport::new(1)))?;
//! let ctx = runtime.ctx_create(0, ContextMode::Parallel)?;
//!
//! let ptr = ctx.malloc(128, 0)?;
//! ctx.memcpy_h2d(ptr, &[7u8; 128], 0)?;
//!
//! let mut readback = [0u8; 128];
//! ctx.memcpy_d2h(&mut readback, ptr, 0)?;
//! assert_eq!(readback, [7u8; 128]);
//!
//! ctx.free(ptr, 0)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod registry;
pub mod stream;
pub mod table;
pub mod vptr;

pub use config::RuntimeConfig;
pub use context::{Context, ContextMode, FillDst, Module};
pub use device::Device;
pub use error::{Error, Result};
pub use registry::Runtime;
pub use stream::{AddrCell, AddrState, CallSlot, ResultDest, SizeCell, Stream};
pub use table::{AllocRecord, AllocTable};
pub use vptr::{VirtualPtr, INDEX_CAPACITY, MAX_OFFSET};

// Re-export the transport surface embedders implement against.
pub use pulse_transport::{DeviceInfo, HostBuffer, Transport};
