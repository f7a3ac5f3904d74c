//! Host-offload transport layer for pulse
//!
//! This crate defines the narrow call contract between the pulse runtime and
//! whatever actually executes code on an accelerator device:
//! - Process lifecycle (one offload process per device context)
//! - Module loading and symbol resolution on the device
//! - Asynchronous call submission with request handles
//! - Raw memory transfers between host and device
//!
//! # Architecture
//!
//! The design follows these principles:
//! 1. **Narrow seam**: the runtime only ever talks to [`Transport`], so a
//!    hardware backend and the in-process [`EmulatedTransport`] are
//!    interchangeable
//! 2. **Deferred results**: every submission returns a [`RequestId`]; results
//!    are observed through [`Transport::wait_result`] in FIFO order
//! 3. **No background threads**: completion is driven entirely by the caller
//!
//! # Example
//!
//! ```
//! use pulse_transport::{EmulatedTransport, Transport};
//!
//! # fn main() -> Result<(), pulse_transport::Error> {
//! let transport = EmulatedTransport::new(1);
//! let proc = transport.create_process(0, 4)?;
//! let stream = transport.open_stream(proc)?;
//!
//! let req = transport.enqueue_alloc(stream, 1024)?;
//! transport.wait_result(stream, req)?;
//! # Ok(())
//! # }
//! ```

pub mod device_info;
pub mod emulated;
pub mod error;
pub mod layout;
pub mod traits;

pub use device_info::DeviceInfo;
pub use emulated::EmulatedTransport;
pub use error::{Error, Result};
pub use traits::{
    status, CallArg, FuncHandle, HostBuffer, ModuleHandle, ProcHandle, ProcId, RequestId,
    StreamHandle, StreamState, Transport,
};
