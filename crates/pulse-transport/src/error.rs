//! Error types for transport operations

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport operation errors
///
/// The command variants mirror the completion codes an offload transport
/// reports for a finished request; the runtime maps them 1:1 onto its own
/// error enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Offload process creation failed
    #[error("failed to create offload process on device {ordinal}: {message}")]
    ProcessCreate {
        /// Device ordinal
        ordinal: usize,
        /// Error message
        message: String,
    },

    /// Handle does not refer to a live process
    #[error("unknown process handle: {0:#x}")]
    UnknownProcess(u64),

    /// Handle does not refer to an open stream
    #[error("unknown stream handle: {0:#x}")]
    UnknownStream(u64),

    /// Module could not be loaded on the device
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// Symbol lookup in a loaded module failed
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// Request id was never issued on this stream
    #[error("unknown request id: {0}")]
    UnknownRequest(u64),

    /// Device memory exhausted
    #[error("device allocation failed: {size} bytes requested")]
    OutOfMemory {
        /// Requested size
        size: u64,
    },

    /// The command raised an exception on the device
    #[error("command raised an exception on the device")]
    CommandException,

    /// The command failed on the device
    #[error("command failed on the device")]
    CommandError,

    /// The command has not finished yet
    #[error("command has not finished")]
    CommandUnfinished,

    /// The transport reported a completion code this crate does not know
    #[error("unknown command completion code: {0}")]
    CommandUnknown(u64),
}

impl Error {
    /// Create a process-creation error
    #[inline]
    pub fn process_create(ordinal: usize, message: impl Into<String>) -> Self {
        Self::ProcessCreate { ordinal, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfMemory { size: 4096 };
        assert!(err.to_string().contains("4096"));

        let err = Error::UnknownStream(0xbeef);
        assert!(err.to_string().contains("0xbeef"));
    }
}
