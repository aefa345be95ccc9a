//! # warp-objstore: object store client interface for block volumes
//!
//! Block volumes are stored as blobs of fixed-size objects. A blob is
//! addressed by `(domain, volume, blob)` and each of its objects by an
//! index. The store supports single-object updates and multi-object
//! transactions scoped to one blob.
//!
//! ## Quick Start
//!
//! ```rust
//! use bytes::Bytes;
//! use warp_objstore::{BlobKey, MemoryStore, ObjectStore, VolumePolicy};
//!
//! # async fn demo() -> warp_objstore::Result<()> {
//! let store = MemoryStore::new();
//! store.create_volume("default", "vol1", VolumePolicy::new(1 << 20, 4096))?;
//!
//! let blob = BlobKey::new("default", "vol1", "nbd")?;
//! let txn = store.begin(&blob).await?;
//! store.update(&blob.object(0), Bytes::from_static(b"first"), Some(txn)).await?;
//! store.update(&blob.object(1), Bytes::from_static(b"second"), Some(txn)).await?;
//! store.commit(txn).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod key;

pub use backend::{
    BlobMeta, MemoryStore, MemoryStoreStats, ObjectStore, TxnId, VolumePolicy,
};
pub use error::{Error, Result};
pub use key::{BlobKey, ObjectKey};
