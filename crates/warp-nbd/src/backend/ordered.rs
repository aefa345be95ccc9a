//! Ordering decorator
//!
//! Wraps a backend so that operations whose ranges overlap run in the order
//! they were issued, while operations on disjoint ranges run freely.
//!
//! Ranges are tracked per export at block granularity (block index =
//! `offset / object_size`). Each block maps to the completion signal of
//! the last operation issued against it. Issuing an operation, under one
//! lock:
//!
//! 1. collects the distinct signals registered on its blocks, then
//! 2. registers its own signal on every one of those blocks.
//!
//! The returned completion waits for all collected signals before calling
//! the wrapped backend. A predecessor counts as finished whether it
//! succeeded, failed, or was dropped; its outcome never reaches dependents.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use super::{BlockBackend, Completion};
use crate::error::BlockResult;

/// Granularity used for an export whose object size is not known yet
pub const DEFAULT_GRANULARITY: u64 = 4096;

/// Last operation registered on a block
struct Pending {
    seq: u64,
    done: watch::Receiver<bool>,
}

/// export -> block index -> pending operation
type PendingMap = Mutex<HashMap<String, HashMap<u64, Pending>>>;

/// Registration of one in-flight operation
///
/// Dropping it signals completion and removes the blocks still pointing at
/// this operation.
struct Registration {
    seq: u64,
    export: String,
    blocks: RangeInclusive<u64>,
    done: watch::Sender<bool>,
    pending: Arc<PendingMap>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.done.send_replace(true);

        let mut pending = self.pending.lock();
        if let Some(blocks) = pending.get_mut(&self.export) {
            for index in self.blocks.clone() {
                if blocks.get(&index).is_some_and(|p| p.seq == self.seq) {
                    blocks.remove(&index);
                }
            }
            if blocks.is_empty() {
                pending.remove(&self.export);
            }
        }
    }
}

/// Wait for every predecessor to finish
async fn wait_all(predecessors: Vec<watch::Receiver<bool>>) {
    for mut done in predecessors {
        // A closed channel means the predecessor is gone, which also counts
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Backend decorator serializing overlapping operations
pub struct OrderedBackend<B> {
    inner: Arc<B>,
    pending: Arc<PendingMap>,
    granularity: DashMap<String, u64>,
    default_granularity: u64,
    next_seq: AtomicU64,
}

impl<B: BlockBackend> OrderedBackend<B> {
    /// Wrap a backend
    pub fn new(inner: B) -> Self {
        Self::with_granularity(inner, DEFAULT_GRANULARITY)
    }

    /// Wrap a backend, tracking unknown exports at `default_granularity`
    pub fn with_granularity(inner: B, default_granularity: u64) -> Self {
        Self {
            inner: Arc::new(inner),
            pending: Arc::new(Mutex::new(HashMap::new())),
            granularity: DashMap::new(),
            default_granularity: default_granularity.max(1),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Get the wrapped backend
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Number of blocks of `export` with an operation in flight
    pub fn pending_blocks(&self, export: &str) -> usize {
        self.pending.lock().get(export).map_or(0, HashMap::len)
    }

    /// Block granularity of an export, fixed on first use
    fn granularity(&self, export: &str) -> u64 {
        if let Some(granularity) = self.granularity.get(export) {
            return *granularity;
        }
        *self
            .granularity
            .entry(export.to_string())
            .or_insert(self.default_granularity)
    }

    /// Register an operation over `[offset, offset + length)`
    ///
    /// Returns the signals it has to wait for and its own registration.
    fn register(
        &self,
        export: &str,
        offset: u64,
        length: u64,
    ) -> (Vec<watch::Receiver<bool>>, Option<Registration>) {
        if length == 0 {
            return (Vec::new(), None);
        }

        let granularity = self.granularity(export);
        let first = offset / granularity;
        let last = offset.saturating_add(length - 1) / granularity;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);

        let mut predecessors = Vec::new();
        {
            let mut pending = self.pending.lock();
            let blocks = pending.entry(export.to_string()).or_default();
            let mut seen = HashSet::new();

            for index in first..=last {
                let previous = blocks.insert(
                    index,
                    Pending {
                        seq,
                        done: done_rx.clone(),
                    },
                );
                if let Some(previous) = previous {
                    if seen.insert(previous.seq) {
                        predecessors.push(previous.done);
                    }
                }
            }
        }

        trace!(
            export,
            seq,
            first,
            last,
            predecessors = predecessors.len(),
            "Registered operation"
        );

        let registration = Registration {
            seq,
            export: export.to_string(),
            blocks: first..=last,
            done: done_tx,
            pending: self.pending.clone(),
        };
        (predecessors, Some(registration))
    }

    /// Signals of every operation currently registered on `export`
    fn outstanding(&self, export: &str) -> Vec<watch::Receiver<bool>> {
        let pending = self.pending.lock();
        let Some(blocks) = pending.get(export) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        blocks
            .values()
            .filter(|p| seen.insert(p.seq))
            .map(|p| p.done.clone())
            .collect()
    }
}

#[async_trait]
impl<B: BlockBackend> BlockBackend for OrderedBackend<B> {
    async fn exists(&self, export: &str) -> BlockResult<bool> {
        let found = self.inner.exists(export).await?;
        if found && !self.granularity.contains_key(export) {
            let object_size = self.inner.object_size(export).await?.max(1);
            self.granularity
                .entry(export.to_string())
                .or_insert(object_size);
        }
        Ok(found)
    }

    async fn size(&self, export: &str) -> BlockResult<u64> {
        self.inner.size(export).await
    }

    async fn object_size(&self, export: &str) -> BlockResult<u64> {
        self.inner.object_size(export).await
    }

    fn read(&self, export: &str, offset: u64, length: u32) -> Completion<Bytes> {
        let (predecessors, registration) = self.register(export, offset, length as u64);
        let inner = self.inner.clone();
        let export = export.to_string();

        Box::pin(async move {
            let _registration = registration;
            wait_all(predecessors).await;
            inner.read(&export, offset, length).await
        })
    }

    fn write(&self, export: &str, offset: u64, data: Bytes) -> Completion<()> {
        let (predecessors, registration) = self.register(export, offset, data.len() as u64);
        let inner = self.inner.clone();
        let export = export.to_string();

        Box::pin(async move {
            let _registration = registration;
            wait_all(predecessors).await;
            inner.write(&export, offset, data).await
        })
    }

    fn flush(&self, export: &str) -> Completion<()> {
        // Barrier over everything issued so far; later operations do not wait for it
        let predecessors = self.outstanding(export);
        let inner = self.inner.clone();
        let export = export.to_string();

        Box::pin(async move {
            wait_all(predecessors).await;
            inner.flush(&export).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockError;
    use std::time::Duration;
    use tokio::sync::oneshot;

    const OBJECT_SIZE: u64 = 4096;
    const FAIL_TAG: u8 = 0xEE;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Start(u8),
        End(u8),
        Flush,
    }

    /// Backend recording when calls start and end
    ///
    /// Writes are tagged by their first byte. A tagged write with a gate
    /// installed blocks until the gate's sender fires or is dropped.
    #[derive(Default)]
    struct RecordingBackend {
        events: Arc<Mutex<Vec<Event>>>,
        gates: Mutex<HashMap<u8, oneshot::Receiver<()>>>,
    }

    impl RecordingBackend {
        fn gate(&self, tag: u8) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().insert(tag, rx);
            tx
        }
    }

    #[async_trait]
    impl BlockBackend for RecordingBackend {
        async fn exists(&self, _export: &str) -> BlockResult<bool> {
            Ok(true)
        }

        async fn size(&self, _export: &str) -> BlockResult<u64> {
            Ok(64 * OBJECT_SIZE)
        }

        async fn object_size(&self, _export: &str) -> BlockResult<u64> {
            Ok(OBJECT_SIZE)
        }

        fn read(&self, _export: &str, _offset: u64, length: u32) -> Completion<Bytes> {
            let events = self.events.clone();
            events.lock().push(Event::Start(0));
            Box::pin(async move {
                events.lock().push(Event::End(0));
                Ok(Bytes::from(vec![0u8; length as usize]))
            })
        }

        fn write(&self, _export: &str, _offset: u64, data: Bytes) -> Completion<()> {
            let tag = data[0];
            let events = self.events.clone();
            events.lock().push(Event::Start(tag));
            let gate = self.gates.lock().remove(&tag);

            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                events.lock().push(Event::End(tag));
                if tag == FAIL_TAG {
                    Err(BlockError::Task("injected failure".to_string()))
                } else {
                    Ok(())
                }
            })
        }

        fn flush(&self, _export: &str) -> Completion<()> {
            let events = self.events.clone();
            Box::pin(async move {
                events.lock().push(Event::Flush);
                Ok(())
            })
        }
    }

    async fn ordered() -> OrderedBackend<RecordingBackend> {
        let backend = OrderedBackend::new(RecordingBackend::default());
        assert!(backend.exists("vol").await.unwrap());
        backend
    }

    fn tagged(tag: u8, len: u64) -> Bytes {
        Bytes::from(vec![tag; len as usize])
    }

    fn events(backend: &OrderedBackend<RecordingBackend>) -> Vec<Event> {
        backend.inner().events.lock().clone()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_overlapping_writes_run_in_issue_order() {
        let backend = ordered().await;
        let release = backend.inner().gate(1);

        let w1 = tokio::spawn(backend.write("vol", 0, tagged(1, OBJECT_SIZE)));
        let w2 = tokio::spawn(backend.write("vol", 0, tagged(2, OBJECT_SIZE)));
        settle().await;

        // W2 must not have reached the backend while W1 is held
        assert_eq!(events(&backend), vec![Event::Start(1)]);

        release.send(()).unwrap();
        w1.await.unwrap().unwrap();
        w2.await.unwrap().unwrap();

        assert_eq!(
            events(&backend),
            vec![
                Event::Start(1),
                Event::End(1),
                Event::Start(2),
                Event::End(2)
            ]
        );
    }

    #[tokio::test]
    async fn test_disjoint_writes_do_not_wait() {
        let backend = ordered().await;
        let release = backend.inner().gate(1);

        let w1 = tokio::spawn(backend.write("vol", 0, tagged(1, OBJECT_SIZE)));
        let w3 = backend.write("vol", 10 * OBJECT_SIZE, tagged(3, OBJECT_SIZE));

        // W3 finishes while W1 is still held
        tokio::time::timeout(Duration::from_secs(1), w3)
            .await
            .unwrap()
            .unwrap();
        assert!(!w1.is_finished());

        release.send(()).unwrap();
        w1.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ordering_is_by_block_not_byte() {
        let backend = ordered().await;
        let release = backend.inner().gate(1);

        // Same block, non-overlapping bytes
        let w1 = tokio::spawn(backend.write("vol", 0, tagged(1, 10)));
        let w2 = tokio::spawn(backend.write("vol", 100, tagged(2, 10)));
        settle().await;
        assert_eq!(events(&backend), vec![Event::Start(1)]);

        release.send(()).unwrap();
        w1.await.unwrap().unwrap();
        w2.await.unwrap().unwrap();
        assert_eq!(events(&backend).len(), 4);
    }

    #[tokio::test]
    async fn test_waits_for_every_predecessor() {
        let backend = ordered().await;
        let release_a = backend.inner().gate(1);
        let release_b = backend.inner().gate(2);

        let a = tokio::spawn(backend.write("vol", 0, tagged(1, OBJECT_SIZE)));
        let b = tokio::spawn(backend.write("vol", 2 * OBJECT_SIZE, tagged(2, OBJECT_SIZE)));
        // Spans blocks 0..=2, overlapping both
        let c = tokio::spawn(backend.write("vol", 0, tagged(3, 3 * OBJECT_SIZE)));
        settle().await;

        release_a.send(()).unwrap();
        a.await.unwrap().unwrap();
        settle().await;
        assert!(!events(&backend).contains(&Event::Start(3)));

        release_b.send(()).unwrap();
        b.await.unwrap().unwrap();
        c.await.unwrap().unwrap();
        assert_eq!(events(&backend).last(), Some(&Event::End(3)));
    }

    #[tokio::test]
    async fn test_failed_predecessor_unblocks_dependent() {
        let backend = ordered().await;

        let w1 = backend.write("vol", 0, tagged(FAIL_TAG, OBJECT_SIZE));
        let w2 = backend.write("vol", 0, tagged(2, OBJECT_SIZE));

        assert!(w1.await.is_err());
        w2.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_predecessor_unblocks_dependent() {
        let backend = ordered().await;

        let w1 = backend.write("vol", 0, tagged(1, OBJECT_SIZE));
        let w2 = backend.write("vol", 0, tagged(2, OBJECT_SIZE));
        drop(w1);

        tokio::time::timeout(Duration::from_secs(1), w2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events(&backend), vec![Event::Start(2), Event::End(2)]);
    }

    #[tokio::test]
    async fn test_reads_are_ordered_after_writes() {
        let backend = ordered().await;
        let release = backend.inner().gate(1);

        let w1 = tokio::spawn(backend.write("vol", 0, tagged(1, OBJECT_SIZE)));
        let r = tokio::spawn(backend.read("vol", 10, 20));
        settle().await;
        assert_eq!(events(&backend), vec![Event::Start(1)]);

        release.send(()).unwrap();
        w1.await.unwrap().unwrap();
        assert_eq!(r.await.unwrap().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_flush_waits_for_outstanding_writes() {
        let backend = ordered().await;
        let release = backend.inner().gate(1);

        let w1 = tokio::spawn(backend.write("vol", 0, tagged(1, OBJECT_SIZE)));
        let mut flush = backend.flush("vol");

        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut flush)
                .await
                .is_err()
        );

        release.send(()).unwrap();
        flush.await.unwrap();
        w1.await.unwrap().unwrap();
        assert_eq!(
            events(&backend),
            vec![Event::Start(1), Event::End(1), Event::Flush]
        );
    }

    #[tokio::test]
    async fn test_registrations_are_released() {
        let backend = ordered().await;

        let w1 = backend.write("vol", 0, tagged(1, 3 * OBJECT_SIZE));
        let w2 = backend.write("vol", OBJECT_SIZE, tagged(2, OBJECT_SIZE));
        assert_eq!(backend.pending_blocks("vol"), 3);

        w1.await.unwrap();
        // Block 1 now belongs to W2
        assert_eq!(backend.pending_blocks("vol"), 1);

        w2.await.unwrap();
        assert_eq!(backend.pending_blocks("vol"), 0);
    }

    #[tokio::test]
    async fn test_exports_are_independent() {
        let backend = ordered().await;
        assert!(backend.exists("other").await.unwrap());
        let release = backend.inner().gate(1);

        let w1 = tokio::spawn(backend.write("vol", 0, tagged(1, OBJECT_SIZE)));
        let w2 = backend.write("other", 0, tagged(2, OBJECT_SIZE));

        tokio::time::timeout(Duration::from_secs(1), w2)
            .await
            .unwrap()
            .unwrap();

        release.send(()).unwrap();
        w1.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_length_is_not_tracked() {
        let backend = ordered().await;

        let read = backend.read("vol", 0, 0);
        assert_eq!(backend.pending_blocks("vol"), 0);
        assert!(read.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_granularity_before_exists() {
        let backend = OrderedBackend::with_granularity(RecordingBackend::default(), 512);

        let w1 = backend.write("fresh", 0, tagged(1, 1024));
        assert_eq!(backend.pending_blocks("fresh"), 2);
        w1.await.unwrap();

        // Granularity stays fixed even after the object size is learned
        backend.exists("fresh").await.unwrap();
        let w2 = backend.write("fresh", 0, tagged(2, 1024));
        assert_eq!(backend.pending_blocks("fresh"), 2);
        w2.await.unwrap();
    }
}
