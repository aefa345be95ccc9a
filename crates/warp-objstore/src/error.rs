//! Error types for warp-objstore

use thiserror::Error;

/// Result type for warp-objstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in warp-objstore
#[derive(Error, Debug)]
pub enum Error {
    /// Volume not found in the domain
    #[error("volume not found: {domain}/{volume}")]
    VolumeNotFound {
        /// Domain name
        domain: String,
        /// Volume name
        volume: String,
    },

    /// Blob has never been written
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Object has never been written
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Object larger than the volume's object size
    #[error("object too large: {size} bytes exceeds maximum of {max} bytes")]
    ObjectTooLarge {
        /// Actual size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// Unknown or already finished transaction
    #[error("transaction not found: {0}")]
    TransactionNotFound(u64),

    /// Transaction used for an object outside the blob it was opened on
    #[error("transaction {txn} is scoped to {expected}, not {found}")]
    TransactionScope {
        /// Transaction id
        txn: u64,
        /// Blob the transaction was opened on
        expected: String,
        /// Blob the update addressed
        found: String,
    },

    /// Invalid key component
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// True when the addressed object is simply absent.
    ///
    /// Block-device readers treat this as a hole and substitute zeroes.
    pub fn is_object_missing(&self) -> bool {
        matches!(self, Error::ObjectNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_missing_classification() {
        assert!(Error::ObjectNotFound("d/v/b#0".to_string()).is_object_missing());
        assert!(!Error::BlobNotFound("d/v/b".to_string()).is_object_missing());
        assert!(!Error::Backend("boom".to_string()).is_object_missing());
    }

    #[test]
    fn test_error_display() {
        let err = Error::VolumeNotFound {
            domain: "default".to_string(),
            volume: "vol1".to_string(),
        };
        assert_eq!(err.to_string(), "volume not found: default/vol1");

        let err = Error::ObjectTooLarge { size: 10, max: 4 };
        assert!(err.to_string().contains("10 bytes"));
    }
}
