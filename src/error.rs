//! Error types for conduit.
//!
//! Only setup and configuration failures are errors. Running out of free
//! buffers is ordinary backpressure and is reported through `bool`/`Option`
//! returns, and protocol violations (using a port before its handshake is
//! complete, releasing a buffer twice) panic.

use thiserror::Error;

/// Result type alias using conduit's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for conduit operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An endpoint string could not be parsed.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// No registered driver supports the given endpoint(s).
    #[error("no transfer driver supports endpoint '{0}'")]
    UnsupportedEndpoint(String),

    /// Every mailbox number for a protocol is in use.
    #[error("no free mailbox for protocol '{protocol}' (max {max})")]
    MailboxExhausted {
        /// Protocol whose mailbox space is exhausted.
        protocol: String,
        /// Configured number of mailboxes.
        max: u16,
    },

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// An access fell outside a shared region.
    #[error("access of {len} bytes at offset {offset} is outside region of {size} bytes")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Size of the region.
        size: usize,
    },

    /// A flow-control descriptor was malformed or incompatible with the local port.
    #[error("descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// The requested port-set pairing has no transfer controller.
    #[error("unsupported circuit topology: {0}")]
    UnsupportedTopology(String),

    /// A worker port name or index was not found.
    #[error("port not found: {0}")]
    PortNotFound(String),

    /// A worker id was not found.
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// A posted transfer failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// The transport context was used before `init` or after the final `shutdown`.
    #[error("transport context is not initialized")]
    NotInitialized,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Process-manager failure.
    #[error("process error: {0}")]
    Process(String),

    /// Invalid memory segment operation.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
