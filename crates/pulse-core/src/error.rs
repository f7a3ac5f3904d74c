//! Error types for runtime operations

use pulse_transport::status;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime operation errors
///
/// Internal code propagates these with `?`; nothing in this crate panics
/// across a public entry point. The out-of-process API surface translates
/// each variant into its status code; here they stay typed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Runtime has not been brought up
    #[error("runtime is not initialized")]
    NotInitialized,

    /// Runtime was brought up twice
    #[error("runtime is already initialized")]
    AlreadyInitialized,

    /// Transport reported no usable devices
    #[error("no devices found")]
    NoDevices,

    /// Device ordinal out of range, or pointer owned by a different device
    #[error("invalid device: {0}")]
    InvalidDevice(u8),

    /// No context is bound to the calling thread
    #[error("no context is bound to the calling thread")]
    UnknownContext,

    /// Operation on a context that has been destroyed (or never initialized)
    #[error("context is destroyed")]
    ContextDestroyed,

    /// `init` on a context that is already active
    #[error("context is already active")]
    AlreadyActive,

    /// Allocation-index space exhausted, or the device denied an allocation
    #[error("out of memory")]
    OutOfMemory,

    /// No allocation record for the pointer's index
    #[error("unknown virtual pointer: {0:#018x}")]
    UnknownVptr(u64),

    /// Operation requires a base pointer but the handle carries an offset
    #[error("offsetted pointer not allowed: {0:#018x}")]
    OffsetNotAllowed(u64),

    /// Copy range exceeds the allocation
    #[error("out of bounds: offset {offset} + {len} bytes exceeds allocation of {size} bytes")]
    OutOfBounds {
        /// Byte offset carried by the pointer
        offset: u64,
        /// Requested transfer length
        len: u64,
        /// Allocation size
        size: u64,
    },

    /// Address still unknown after forced resolution; the asynchronous
    /// allocation failed upstream
    #[error("uninitialized pointer: {0:#018x}")]
    UninitializedPtr(u64),

    /// Stream index out of range for this context
    #[error("unknown stream: {0}")]
    UnknownStream(usize),

    /// Named function is not a known helper routine
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// Module could not be loaded
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// Argument validation failed
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// Advisory stream-state probe: the stream is still executing
    #[error("stream is running")]
    StreamRunning,

    /// Advisory stream-state probe: the stream is blocked in a device syscall
    #[error("stream is blocked in a syscall")]
    StreamSyscall,

    /// Advisory stream-state probe: the stream is blocked
    #[error("stream is blocked")]
    StreamBlocked,

    /// Advisory stream-state probe: state could not be determined
    #[error("stream state is unknown")]
    StreamUnknown,

    /// Device-side helper routine reported a failure
    #[error("device command failed with status {0}")]
    DeviceCommand(u64),

    /// Opaque transport failure
    #[error("transport: {0}")]
    Transport(#[from] pulse_transport::Error),
}

impl Error {
    /// Map the raw result of a checked device call onto the taxonomy
    pub(crate) fn from_device_status(raw: u64) -> Self {
        match raw {
            status::UNKNOWN_VPTR => Error::UnknownVptr(0),
            status::OUT_OF_MEMORY => Error::OutOfMemory,
            other => Error::DeviceCommand(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfBounds { offset: 64, len: 128, size: 100 };
        assert!(err.to_string().contains("128"));
        assert!(err.to_string().contains("100"));

        let err = Error::UnknownVptr(0xdead_beef);
        assert!(err.to_string().contains("0x00000000deadbeef"));
    }

    #[test]
    fn test_device_status_mapping() {
        assert!(matches!(
            Error::from_device_status(status::OUT_OF_MEMORY),
            Error::OutOfMemory
        ));
        assert!(matches!(Error::from_device_status(77), Error::DeviceCommand(77)));
    }
}
