//! Block-to-object backend
//!
//! Exposes one blob per export as a flat byte range. The blob is split into
//! objects of the volume's fixed object size; byte `b` lives in object
//! `b / object_size` at offset `b % object_size`.
//!
//! - Objects that were never written read as zeroes.
//! - Partial-object writes read the object, splice the new bytes in and
//!   write the whole object back.
//! - A write touching several objects runs inside one store transaction,
//!   so readers see either all of it or none of it.
//! - The backing blob is created the first time an export is looked up, once
//!   per export no matter how many connections look it up concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};
use warp_objstore::{BlobKey, ObjectKey, ObjectStore, TxnId};

use super::{BlockBackend, Completion};
use crate::error::{BlockError, BlockResult};

/// Per-export addressing parameters, read from the volume policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Object size in bytes
    pub object_size: u64,
    /// Export size in bytes
    pub capacity: u64,
}

impl Geometry {
    /// Check that `[offset, offset + length)` lies within the export
    pub fn check_range(&self, offset: u64, length: u64) -> BlockResult<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(BlockError::InvalidOffset {
                offset,
                length,
                size: self.capacity,
            }),
        }
    }
}

/// The part of one object covered by a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    /// Object index
    pub index: u64,
    /// Offset inside the object
    pub start: usize,
    /// Bytes covered
    pub len: usize,
    /// Offset inside the caller's buffer
    pub buf_offset: usize,
}

/// Split `[offset, offset + length)` at object boundaries
///
/// A range running past `u64::MAX` is cut short there; callers check ranges
/// against the export first.
pub(crate) fn split_range(offset: u64, length: u64, object_size: u64) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut pos = offset;
    let end = offset.saturating_add(length);

    while pos < end {
        let index = pos / object_size;
        let start = pos % object_size;
        let len = (object_size - start).min(end - pos);
        segments.push(Segment {
            index,
            start: start as usize,
            len: len as usize,
            buf_offset: (pos - offset) as usize,
        });
        pos += len;
    }

    segments
}

/// Block backend over a warp-objstore blob per export
#[derive(Clone)]
pub struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
    domain: Arc<str>,
    blob: Arc<str>,
    geometry: Arc<DashMap<String, Geometry>>,
    initialized: Arc<DashMap<String, Arc<OnceCell<()>>>>,
}

/// Aborts a transaction that was never finished
///
/// Covers a spanning write whose future is dropped before it commits or
/// aborts, so the store is not left holding an open transaction.
struct OpenTxn {
    store: Arc<dyn ObjectStore>,
    txn: TxnId,
    finished: bool,
}

impl OpenTxn {
    fn new(store: Arc<dyn ObjectStore>, txn: TxnId) -> Self {
        Self {
            store,
            txn,
            finished: false,
        }
    }

    /// Hand the transaction back for its one terminal call
    fn finish(mut self) -> TxnId {
        self.finished = true;
        self.txn
    }
}

impl Drop for OpenTxn {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let txn = self.txn;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%txn, "Transaction dropped outside a runtime, left open");
            return;
        };

        debug!(%txn, "Aborting transaction of a cancelled write");
        let store = self.store.clone();
        runtime.spawn(async move {
            if let Err(e) = store.abort(txn).await {
                warn!(%txn, error = %e, "Abort of cancelled write failed");
            }
        });
    }
}

impl ObjectBackend {
    /// Create a backend serving volumes of `domain` through blob `blob`
    pub fn new(
        store: Arc<dyn ObjectStore>,
        domain: impl Into<String>,
        blob: impl Into<String>,
    ) -> Self {
        Self {
            store,
            domain: Arc::from(domain.into()),
            blob: Arc::from(blob.into()),
            geometry: Arc::new(DashMap::new()),
            initialized: Arc::new(DashMap::new()),
        }
    }

    /// Cached geometry of an export, if it has been looked up
    pub fn cached_geometry(&self, export: &str) -> Option<Geometry> {
        self.geometry.get(export).map(|g| *g)
    }

    fn blob_key(&self, export: &str) -> BlockResult<BlobKey> {
        Ok(BlobKey::new(&*self.domain, export, &*self.blob)?)
    }

    async fn geometry(&self, export: &str) -> BlockResult<Geometry> {
        if let Some(geometry) = self.cached_geometry(export) {
            return Ok(geometry);
        }

        let policy = self.store.volume_policy(&self.domain, export).await?;
        if policy.object_size == 0 {
            return Err(BlockError::Store(warp_objstore::Error::Backend(format!(
                "volume {} has a zero object size",
                export
            ))));
        }

        let geometry = Geometry {
            object_size: policy.object_size,
            capacity: policy.capacity,
        };
        debug!(export, ?geometry, "Cached export geometry");

        // First lookup wins so concurrent callers agree
        Ok(*self
            .geometry
            .entry(export.to_string())
            .or_insert(geometry))
    }

    async fn read_range(self, export: String, offset: u64, length: u32) -> BlockResult<Bytes> {
        let geometry = self.geometry(&export).await?;
        geometry.check_range(offset, length as u64)?;
        let blob = self.blob_key(&export)?;

        let mut out = BytesMut::zeroed(length as usize);
        let mut fetches = JoinSet::new();

        for segment in split_range(offset, length as u64, geometry.object_size) {
            let store = self.store.clone();
            let key = blob.object(segment.index);
            fetches.spawn(async move {
                let object = fetch_object(&*store, &key, geometry.object_size).await?;
                Ok::<_, BlockError>((segment, object))
            });
        }

        while let Some(joined) = fetches.join_next().await {
            let (segment, object) = joined.map_err(|e| BlockError::Task(e.to_string()))??;
            out[segment.buf_offset..segment.buf_offset + segment.len]
                .copy_from_slice(&object[segment.start..segment.start + segment.len]);
        }

        trace!(export = %export, offset, length, "Read complete");
        Ok(out.freeze())
    }

    async fn write_range(self, export: String, offset: u64, data: Bytes) -> BlockResult<()> {
        let geometry = self.geometry(&export).await?;
        geometry.check_range(offset, data.len() as u64)?;
        let blob = self.blob_key(&export)?;
        let segments = split_range(offset, data.len() as u64, geometry.object_size);

        match segments.as_slice() {
            [] => Ok(()),
            [segment] => {
                write_segment(
                    &*self.store,
                    blob.object(segment.index),
                    *segment,
                    &data,
                    geometry.object_size,
                    None,
                )
                .await
            }
            _ => {
                let txn = self.store.begin(&blob).await?;
                let open = OpenTxn::new(self.store.clone(), txn);
                trace!(export = %export, %txn, objects = segments.len(), "Spanning write");

                let mut writes = JoinSet::new();
                for segment in segments.iter().copied() {
                    let store = self.store.clone();
                    let key = blob.object(segment.index);
                    let data = data.clone();
                    writes.spawn(async move {
                        write_segment(&*store, key, segment, &data, geometry.object_size, Some(txn))
                            .await
                    });
                }

                // Let every sub-write settle before the transaction is finished
                let mut failure = None;
                while let Some(joined) = writes.join_next().await {
                    let result = joined
                        .map_err(|e| BlockError::Task(e.to_string()))
                        .and_then(|r| r);
                    if let Err(e) = result {
                        failure.get_or_insert(e);
                    }
                }

                let txn = open.finish();
                match failure {
                    None => self.commit(txn).await,
                    Some(e) => {
                        warn!(export = %export, %txn, error = %e, "Sub-write failed, aborting transaction");
                        if let Err(abort_err) = self.store.abort(txn).await {
                            warn!(export = %export, %txn, error = %abort_err, "Abort failed");
                        }
                        Err(BlockError::TransactionAborted(e.to_string()))
                    }
                }
            }
        }
    }

    /// Commit a transaction; a failed commit has already closed it
    async fn commit(&self, txn: TxnId) -> BlockResult<()> {
        self.store.commit(txn).await.map_err(|e| {
            warn!(%txn, error = %e, "Commit failed");
            BlockError::TransactionAborted(e.to_string())
        })
    }

    /// Create the backing blob if it was never written
    async fn initialize(&self, export: &str, blob: &BlobKey) -> BlockResult<()> {
        let cell = self
            .initialized
            .entry(export.to_string())
            .or_default()
            .value()
            .clone();

        // Concurrent lookups wait here, so the empty object 0 can never land
        // after a write another connection already had acknowledged
        cell.get_or_try_init(|| async {
            match self.store.stat(blob).await {
                Ok(_) => Ok(()),
                Err(warp_objstore::Error::BlobNotFound(_)) => {
                    info!(export, blob = %blob, "Initializing data blob");
                    self.store.update(&blob.object(0), Bytes::new(), None).await?;
                    Ok(())
                }
                Err(e) => Err(BlockError::from(e)),
            }
        })
        .await?;
        Ok(())
    }
}

/// Fetch a whole object, zero-filling holes and short objects
async fn fetch_object(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    object_size: u64,
) -> BlockResult<Bytes> {
    match store.get(key).await {
        Ok(data) if data.len() as u64 >= object_size => Ok(data),
        Ok(data) => {
            let mut padded = BytesMut::zeroed(object_size as usize);
            padded[..data.len()].copy_from_slice(&data);
            Ok(padded.freeze())
        }
        Err(e) if e.is_object_missing() => Ok(Bytes::from(vec![0u8; object_size as usize])),
        Err(e) => Err(e.into()),
    }
}

/// Write one segment, merging with the existing object unless it is fully covered
async fn write_segment(
    store: &dyn ObjectStore,
    key: ObjectKey,
    segment: Segment,
    data: &Bytes,
    object_size: u64,
    txn: Option<TxnId>,
) -> BlockResult<()> {
    let chunk = data.slice(segment.buf_offset..segment.buf_offset + segment.len);

    let object = if segment.len as u64 == object_size {
        chunk
    } else {
        let existing = fetch_object(store, &key, object_size).await?;
        let mut merged = BytesMut::from(&existing[..]);
        merged[segment.start..segment.start + segment.len].copy_from_slice(&chunk);
        merged.freeze()
    };

    store.update(&key, object, txn).await?;
    Ok(())
}

#[async_trait]
impl BlockBackend for ObjectBackend {
    async fn exists(&self, export: &str) -> BlockResult<bool> {
        let blob = match self.blob_key(export) {
            Ok(blob) => blob,
            Err(_) => return Ok(false),
        };

        match self.geometry(export).await {
            Ok(_) => {}
            Err(BlockError::Store(warp_objstore::Error::VolumeNotFound { .. })) => {
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.initialize(export, &blob).await?;
        Ok(true)
    }

    async fn size(&self, export: &str) -> BlockResult<u64> {
        Ok(self.geometry(export).await?.capacity)
    }

    async fn object_size(&self, export: &str) -> BlockResult<u64> {
        Ok(self.geometry(export).await?.object_size)
    }

    fn read(&self, export: &str, offset: u64, length: u32) -> Completion<Bytes> {
        Box::pin(self.clone().read_range(export.to_string(), offset, length))
    }

    fn write(&self, export: &str, offset: u64, data: Bytes) -> Completion<()> {
        Box::pin(self.clone().write_range(export.to_string(), offset, data))
    }

    fn flush(&self, export: &str) -> Completion<()> {
        // Updates are applied by the store as they complete; nothing is buffered here
        trace!(export, "Flush");
        Box::pin(async { Ok(()) })
    }
}
