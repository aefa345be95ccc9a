//! In-memory object store
//!
//! Keeps every blob as a map from object index to object bytes. Transactions
//! stage their updates next to the committed state and apply them under a
//! single write lock on commit, so readers never observe half of one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{BlobMeta, ObjectStore, TxnId, VolumePolicy};
use crate::key::{BlobKey, ObjectKey};
use crate::{Error, Result};

/// Updates staged by an open transaction
struct StagedTxn {
    blob: BlobKey,
    writes: Vec<(u64, Bytes)>,
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// `get` calls
    pub gets: u64,
    /// `update` calls that succeeded
    pub updates: u64,
    /// Transactions committed
    pub commits: u64,
    /// Transactions aborted
    pub aborts: u64,
}

/// In-memory object store
pub struct MemoryStore {
    volumes: DashMap<(String, String), VolumePolicy>,
    blobs: RwLock<HashMap<BlobKey, BTreeMap<u64, Bytes>>>,
    txns: Mutex<HashMap<TxnId, StagedTxn>>,
    next_txn: AtomicU64,
    /// Countdown to an injected update failure
    fail_update_in: Mutex<Option<u64>>,
    /// Countdown to an injected commit failure
    fail_commit_in: Mutex<Option<u64>>,
    gets: AtomicU64,
    updates: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            volumes: DashMap::new(),
            blobs: RwLock::new(HashMap::new()),
            txns: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            fail_update_in: Mutex::new(None),
            fail_commit_in: Mutex::new(None),
            gets: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    /// Provision a volume
    ///
    /// Re-provisioning an existing volume replaces its policy; blobs are kept.
    pub fn create_volume(
        &self,
        domain: impl Into<String>,
        volume: impl Into<String>,
        policy: VolumePolicy,
    ) -> Result<()> {
        let domain = domain.into();
        let volume = volume.into();

        if policy.object_size == 0 {
            return Err(Error::Backend("object size must be non-zero".to_string()));
        }

        debug!(%domain, %volume, ?policy, "Provisioned volume");
        self.volumes.insert((domain, volume), policy);
        Ok(())
    }

    /// Remove a volume and all of its blobs
    pub fn remove_volume(&self, domain: &str, volume: &str) -> bool {
        let removed = self
            .volumes
            .remove(&(domain.to_string(), volume.to_string()))
            .is_some();
        if removed {
            self.blobs
                .write()
                .retain(|key, _| !(key.domain() == domain && key.volume() == volume));
        }
        removed
    }

    /// Make the `n`-th update from now fail (1 = the next one)
    pub fn fail_nth_update(&self, n: u64) {
        *self.fail_update_in.lock() = if n == 0 { None } else { Some(n) };
    }

    /// Make the `n`-th commit from now fail (1 = the next one)
    ///
    /// The failing transaction is closed with none of its updates applied.
    pub fn fail_nth_commit(&self, n: u64) {
        *self.fail_commit_in.lock() = if n == 0 { None } else { Some(n) };
    }

    /// Committed content of an object, bypassing transactions
    pub fn committed(&self, key: &ObjectKey) -> Option<Bytes> {
        self.blobs
            .read()
            .get(key.blob())
            .and_then(|objects| objects.get(&key.index()).cloned())
    }

    /// Number of transactions neither committed nor aborted
    pub fn open_transactions(&self) -> usize {
        self.txns.lock().len()
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            gets: self.gets.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
        }
    }

    fn policy(&self, domain: &str, volume: &str) -> Result<VolumePolicy> {
        self.volumes
            .get(&(domain.to_string(), volume.to_string()))
            .map(|p| *p)
            .ok_or_else(|| Error::VolumeNotFound {
                domain: domain.to_string(),
                volume: volume.to_string(),
            })
    }

    fn take_injected_failure(countdown: &Mutex<Option<u64>>) -> bool {
        let mut countdown = countdown.lock();
        match *countdown {
            Some(1) => {
                *countdown = None;
                true
            }
            Some(n) => {
                *countdown = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn volume_policy(&self, domain: &str, volume: &str) -> Result<VolumePolicy> {
        self.policy(domain, volume)
    }

    async fn stat(&self, blob: &BlobKey) -> Result<BlobMeta> {
        self.policy(blob.domain(), blob.volume())?;

        let blobs = self.blobs.read();
        let objects = blobs
            .get(blob)
            .ok_or_else(|| Error::BlobNotFound(blob.to_path()))?;

        Ok(BlobMeta {
            object_count: objects.len() as u64,
            stored_bytes: objects.values().map(|o| o.len() as u64).sum(),
        })
    }

    async fn get(&self, key: &ObjectKey) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "Reading object");

        let blob = key.blob();
        self.policy(blob.domain(), blob.volume())?;

        self.blobs
            .read()
            .get(blob)
            .and_then(|objects| objects.get(&key.index()).cloned())
            .ok_or_else(|| Error::ObjectNotFound(key.to_path()))
    }

    async fn update(&self, key: &ObjectKey, data: Bytes, txn: Option<TxnId>) -> Result<()> {
        let blob = key.blob();
        let policy = self.policy(blob.domain(), blob.volume())?;

        if data.len() as u64 > policy.object_size {
            return Err(Error::ObjectTooLarge {
                size: data.len() as u64,
                max: policy.object_size,
            });
        }

        if Self::take_injected_failure(&self.fail_update_in) {
            warn!(key = %key, "Injected update failure");
            return Err(Error::Backend(format!("injected failure updating {}", key)));
        }

        trace!(key = %key, size = data.len(), ?txn, "Writing object");

        match txn {
            Some(txn) => {
                let mut txns = self.txns.lock();
                let staged = txns
                    .get_mut(&txn)
                    .ok_or(Error::TransactionNotFound(txn.raw()))?;
                if &staged.blob != blob {
                    return Err(Error::TransactionScope {
                        txn: txn.raw(),
                        expected: staged.blob.to_path(),
                        found: blob.to_path(),
                    });
                }
                staged.writes.push((key.index(), data));
            }
            None => {
                self.blobs
                    .write()
                    .entry(blob.clone())
                    .or_default()
                    .insert(key.index(), data);
            }
        }

        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn begin(&self, blob: &BlobKey) -> Result<TxnId> {
        self.policy(blob.domain(), blob.volume())?;

        let txn = TxnId::from_raw(self.next_txn.fetch_add(1, Ordering::SeqCst));
        self.txns.lock().insert(
            txn,
            StagedTxn {
                blob: blob.clone(),
                writes: Vec::new(),
            },
        );

        trace!(%txn, blob = %blob, "Opened transaction");
        Ok(txn)
    }

    async fn commit(&self, txn: TxnId) -> Result<()> {
        let staged = self
            .txns
            .lock()
            .remove(&txn)
            .ok_or(Error::TransactionNotFound(txn.raw()))?;

        if Self::take_injected_failure(&self.fail_commit_in) {
            warn!(%txn, "Injected commit failure");
            return Err(Error::Backend(format!("injected failure committing {}", txn)));
        }

        let count = staged.writes.len();
        {
            let mut blobs = self.blobs.write();
            let objects = blobs.entry(staged.blob).or_default();
            for (index, data) in staged.writes {
                objects.insert(index, data);
            }
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        trace!(%txn, objects = count, "Committed transaction");
        Ok(())
    }

    async fn abort(&self, txn: TxnId) -> Result<()> {
        self.txns
            .lock()
            .remove(&txn)
            .ok_or(Error::TransactionNotFound(txn.raw()))?;

        self.aborts.fetch_add(1, Ordering::Relaxed);
        trace!(%txn, "Aborted transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_volume() -> (MemoryStore, BlobKey) {
        let store = MemoryStore::new();
        store
            .create_volume("default", "vol1", VolumePolicy::new(4 * 4096, 4096))
            .unwrap();
        let blob = BlobKey::new("default", "vol1", "nbd").unwrap();
        (store, blob)
    }

    #[tokio::test]
    async fn test_volume_policy() {
        let (store, _) = store_with_volume();

        let policy = store.volume_policy("default", "vol1").await.unwrap();
        assert_eq!(policy.object_size, 4096);
        assert_eq!(policy.capacity, 4 * 4096);

        let err = store.volume_policy("default", "missing").await.unwrap_err();
        assert!(matches!(err, Error::VolumeNotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let (store, blob) = store_with_volume();

        let err = store.get(&blob.object(0)).await.unwrap_err();
        assert!(err.is_object_missing());
    }

    #[tokio::test]
    async fn test_update_then_get() {
        let (store, blob) = store_with_volume();
        let key = blob.object(2);

        store
            .update(&key, Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        let data = store.get(&key).await.unwrap();
        assert_eq!(&data[..], b"hello");

        let meta = store.stat(&blob).await.unwrap();
        assert_eq!(meta.object_count, 1);
        assert_eq!(meta.stored_bytes, 5);
    }

    #[tokio::test]
    async fn test_stat_unwritten_blob() {
        let (store, blob) = store_with_volume();

        let err = store.stat(&blob).await.unwrap_err();
        assert!(matches!(err, Error::BlobNotFound(_)));

        // A zero-length update materializes the blob
        store.update(&blob.object(0), Bytes::new(), None).await.unwrap();
        assert!(store.stat(&blob).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_too_large() {
        let (store, blob) = store_with_volume();

        let err = store
            .update(&blob.object(0), Bytes::from(vec![0u8; 4097]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectTooLarge { size: 4097, max: 4096 }));
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let (store, blob) = store_with_volume();

        let txn = store.begin(&blob).await.unwrap();
        store
            .update(&blob.object(0), Bytes::from_static(b"a"), Some(txn))
            .await
            .unwrap();
        store
            .update(&blob.object(1), Bytes::from_static(b"b"), Some(txn))
            .await
            .unwrap();

        // Staged updates are invisible until commit
        assert!(store.get(&blob.object(0)).await.is_err());
        assert_eq!(store.open_transactions(), 1);

        store.commit(txn).await.unwrap();

        assert_eq!(&store.get(&blob.object(0)).await.unwrap()[..], b"a");
        assert_eq!(&store.get(&blob.object(1)).await.unwrap()[..], b"b");
        assert_eq!(store.open_transactions(), 0);
        assert_eq!(store.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_transaction_abort() {
        let (store, blob) = store_with_volume();
        store
            .update(&blob.object(0), Bytes::from_static(b"old"), None)
            .await
            .unwrap();

        let txn = store.begin(&blob).await.unwrap();
        store
            .update(&blob.object(0), Bytes::from_static(b"new"), Some(txn))
            .await
            .unwrap();
        store.abort(txn).await.unwrap();

        assert_eq!(&store.get(&blob.object(0)).await.unwrap()[..], b"old");
        assert_eq!(store.stats().aborts, 1);

        // Finished transactions cannot be reused
        assert!(matches!(
            store.commit(txn).await.unwrap_err(),
            Error::TransactionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_transaction_scope() {
        let (store, blob) = store_with_volume();
        let other = BlobKey::new("default", "vol1", "other").unwrap();

        let txn = store.begin(&blob).await.unwrap();
        let err = store
            .update(&other.object(0), Bytes::from_static(b"x"), Some(txn))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransactionScope { .. }));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (store, blob) = store_with_volume();
        store.fail_nth_update(2);

        store
            .update(&blob.object(0), Bytes::from_static(b"1"), None)
            .await
            .unwrap();
        assert!(
            store
                .update(&blob.object(1), Bytes::from_static(b"2"), None)
                .await
                .is_err()
        );
        store
            .update(&blob.object(1), Bytes::from_static(b"3"), None)
            .await
            .unwrap();

        assert_eq!(store.stats().updates, 2);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_closes_transaction() {
        let (store, blob) = store_with_volume();
        store
            .update(&blob.object(0), Bytes::from_static(b"old"), None)
            .await
            .unwrap();

        store.fail_nth_commit(1);
        let txn = store.begin(&blob).await.unwrap();
        store
            .update(&blob.object(0), Bytes::from_static(b"new"), Some(txn))
            .await
            .unwrap();
        store
            .update(&blob.object(1), Bytes::from_static(b"new"), Some(txn))
            .await
            .unwrap();

        assert!(matches!(
            store.commit(txn).await.unwrap_err(),
            Error::Backend(_)
        ));
        assert_eq!(store.open_transactions(), 0);
        assert_eq!(&store.get(&blob.object(0)).await.unwrap()[..], b"old");
        assert!(store.get(&blob.object(1)).await.is_err());
        assert_eq!(store.stats().commits, 0);

        // Already closed
        assert!(matches!(
            store.abort(txn).await.unwrap_err(),
            Error::TransactionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_volume() {
        let (store, blob) = store_with_volume();
        store
            .update(&blob.object(0), Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        assert!(store.remove_volume("default", "vol1"));
        assert!(!store.remove_volume("default", "vol1"));
        assert!(store.committed(&blob.object(0)).is_none());
    }
}
