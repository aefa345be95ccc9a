//! Object store trait and implementations
//!
//! The `ObjectStore` trait is the client-side view of a store whose native
//! unit is a fixed-size object inside a named blob. It is what the block
//! gateway consumes; the remote protocol behind it is not its concern.

mod memory;

pub use memory::{MemoryStore, MemoryStoreStats};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::key::{BlobKey, ObjectKey};

/// Volume policy metadata
///
/// Fixed when the volume is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePolicy {
    /// Size of every object in the volume's blobs, in bytes
    pub object_size: u64,
    /// Addressable capacity of the volume, in bytes
    pub capacity: u64,
}

impl VolumePolicy {
    /// Create a new policy
    pub fn new(capacity: u64, object_size: u64) -> Self {
        Self {
            object_size,
            capacity,
        }
    }
}

/// Blob metadata returned by `stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobMeta {
    /// Number of objects materialized
    pub object_count: u64,
    /// Bytes held across all objects
    pub stored_bytes: u64,
}

/// Transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(u64);

impl TxnId {
    /// Create from raw value
    pub fn from_raw(val: u64) -> Self {
        Self(val)
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{:08x}", self.0)
    }
}

/// Object store client trait
///
/// Updates issued with a transaction handle stay invisible to `get` until
/// the transaction commits, and are discarded if it aborts.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Get the policy of a volume
    async fn volume_policy(&self, domain: &str, volume: &str) -> Result<VolumePolicy>;

    /// Get blob metadata; `BlobNotFound` if the blob was never written
    async fn stat(&self, blob: &BlobKey) -> Result<BlobMeta>;

    /// Get object data; `ObjectNotFound` if the object was never written
    async fn get(&self, key: &ObjectKey) -> Result<Bytes>;

    /// Replace an object, creating the blob if needed
    async fn update(&self, key: &ObjectKey, data: Bytes, txn: Option<TxnId>) -> Result<()>;

    /// Open a multi-object transaction scoped to one blob
    async fn begin(&self, blob: &BlobKey) -> Result<TxnId>;

    /// Atomically apply every update staged in the transaction
    ///
    /// Commit closes the transaction whether or not it succeeds. A failed
    /// commit applies nothing and the transaction must not be aborted after it.
    async fn commit(&self, txn: TxnId) -> Result<()>;

    /// Discard every update staged in the transaction
    async fn abort(&self, txn: TxnId) -> Result<()>;
}
