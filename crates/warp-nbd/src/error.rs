//! Error types
//!
//! `BlockError` is what the gateway and its backends return internally.
//! Only a reply's status word reaches the client, so every error folds onto
//! one `NbdError` errno value.

use std::io;

use thiserror::Error;

/// Gateway result type
pub type BlockResult<T> = Result<T, BlockError>;

/// Gateway and backend failures
#[derive(Debug, Error)]
pub enum BlockError {
    /// Socket or local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Client broke the wire protocol; the connection cannot continue
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request range falls outside the export
    #[error("Invalid offset: {offset}+{length} (export size: {size})")]
    InvalidOffset { offset: u64, length: u64, size: u64 },

    /// Request payload larger than the gateway accepts
    #[error("Invalid length: {length}")]
    InvalidLength { length: u32 },

    /// Object store failure
    #[error("Store error: {0}")]
    Store(#[from] warp_objstore::Error),

    /// Multi-object write rolled back
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// Backend task panicked or was cancelled
    #[error("Backend task failed: {0}")]
    Task(String),

    /// Bad configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command the gateway recognizes but does not implement
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl BlockError {
    /// Status word to send back for a failed command
    pub fn to_nbd_error(&self) -> NbdError {
        match self {
            BlockError::InvalidOffset { .. }
            | BlockError::InvalidLength { .. }
            | BlockError::Store(warp_objstore::Error::ObjectTooLarge { .. }) => NbdError::Inval,
            BlockError::Io(e) if e.kind() == io::ErrorKind::InvalidInput => NbdError::Inval,
            BlockError::Unsupported(_) => NbdError::NotSup,
            _ => NbdError::Io,
        }
    }
}

/// Reply status codes (Linux errno values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum NbdError {
    /// Success
    #[error("Success")]
    Ok = 0,
    /// EIO
    #[error("I/O error")]
    Io = 5,
    /// EINVAL
    #[error("Invalid argument")]
    Inval = 22,
    /// EOPNOTSUPP
    #[error("Not supported")]
    NotSup = 95,
}

impl NbdError {
    /// Value carried in the reply's error field
    pub fn code(&self) -> u32 {
        *self as u32
    }
}
