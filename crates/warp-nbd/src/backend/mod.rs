//! Block backend contract and implementations
//!
//! `BlockBackend` is what an NBD connection dispatches into. Implementations
//! compose: [`OrderedBackend`] wraps any other backend behind the same trait
//! and adds ordering of overlapping operations, while [`ObjectBackend`] maps
//! byte ranges onto the objects of a warp-objstore blob.
//!
//! ```text
//! NbdConnection ──▶ OrderedBackend ──▶ ObjectBackend ──▶ ObjectStore
//! ```

mod object;
mod ordered;

pub use object::{Geometry, ObjectBackend};
pub use ordered::{DEFAULT_GRANULARITY, OrderedBackend};

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BlockResult;

/// Handle to an issued I/O operation
///
/// The operation counts as issued when the backend method returns, not when
/// the completion is first polled. Completions own everything they touch and
/// can be moved to another task.
pub type Completion<T> = Pin<Box<dyn Future<Output = BlockResult<T>> + Send + 'static>>;

/// Block backend trait
///
/// Every operation is addressed by export name. Implementations must accept
/// concurrent calls for different exports, and for overlapping ranges of the
/// same export unless an ordering layer sits in front of them.
#[async_trait]
pub trait BlockBackend: Send + Sync + 'static {
    /// Whether the export can be served
    async fn exists(&self, export: &str) -> BlockResult<bool>;

    /// Total addressable bytes of the export
    async fn size(&self, export: &str) -> BlockResult<u64>;

    /// Addressing granularity of the export in bytes
    async fn object_size(&self, export: &str) -> BlockResult<u64>;

    /// Read `length` bytes at `offset`
    fn read(&self, export: &str, offset: u64, length: u32) -> Completion<Bytes>;

    /// Write `data` at `offset`
    ///
    /// On success the bytes are visible to every later read.
    fn write(&self, export: &str, offset: u64, data: Bytes) -> Completion<()>;

    /// Make all prior writes on the export durable
    fn flush(&self, export: &str) -> Completion<()>;
}
