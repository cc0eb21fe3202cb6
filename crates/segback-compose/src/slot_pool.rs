//! Pool of reusable archive slots.
//!
//! A fixed number of [`ArchiveSlot`]s cycle through the pool. A worker checks
//! a slot out with [`ArchiveSlotPool::dequeue`], owns it exclusively while it
//! writes, and hands it back. Once a returned slot reaches the size threshold
//! it is sealed, uploaded, and replaced by a fresh slot, so no archive grows
//! past the threshold by more than the last file written into it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::{ArchiveHeader, ArchiveWriter};
use crate::crypter::Crypter;
use crate::error::{ComposeError, Result};
use crate::stats::ComposeStats;
use crate::storage::ObjectStore;

/// One in-flight archive stream.
pub struct ArchiveSlot {
    seq: u64,
    name: String,
    writer: ArchiveWriter,
    crypter: Option<Arc<dyn Crypter>>,
}

impl std::fmt::Debug for ArchiveSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSlot")
            .field("name", &self.name)
            .field("size", &self.writer.size())
            .field("entries", &self.writer.entry_count())
            .finish()
    }
}

impl ArchiveSlot {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            name: format!("part_{}.sar", seq),
            writer: ArchiveWriter::new(),
            crypter: None,
        }
    }

    /// Stable sequence name, used as the key of the file index.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Accumulated size in bytes.
    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    /// True if nothing was written since the slot was created.
    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    /// Attach the crypter. Only the first call has an effect.
    pub fn set_up(&mut self, crypter: &Arc<dyn Crypter>) {
        if self.crypter.is_none() {
            self.crypter = Some(Arc::clone(crypter));
        }
    }

    /// Start a new entry.
    pub fn write_header(&mut self, header: &ArchiveHeader) -> Result<()> {
        self.writer.write_header(header)
    }

    /// Append body bytes of the current entry.
    pub fn write_body(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_body(data)
    }
}

/// Fixed set of archive slots with checkout/return and size-triggered sealing.
pub struct ArchiveSlotPool {
    slots: Mutex<VecDeque<ArchiveSlot>>,
    available: Semaphore,
    next_seq: AtomicU64,
    size_threshold: u64,
    archive_folder: String,
    store: Arc<dyn ObjectStore>,
    stats: Arc<ComposeStats>,
}

impl ArchiveSlotPool {
    /// Create a pool of `slot_count` empty slots whose sealed archives are
    /// written under `archive_folder`.
    pub fn new(
        slot_count: usize,
        size_threshold: u64,
        archive_folder: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        stats: Arc<ComposeStats>,
    ) -> Self {
        let slots: VecDeque<ArchiveSlot> = (1..=slot_count as u64).map(ArchiveSlot::new).collect();
        Self {
            slots: Mutex::new(slots),
            available: Semaphore::new(slot_count),
            next_seq: AtomicU64::new(slot_count as u64 + 1),
            size_threshold,
            archive_folder: archive_folder.into(),
            store,
            stats,
        }
    }

    /// Check out a slot, waiting until one is free.
    /// Returns `Cancelled` if `cancel` fires first, `QueueClosed` after [`finish`](Self::finish).
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<ArchiveSlot> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ComposeError::Cancelled),
            permit = self.available.acquire() => permit.map_err(|_| ComposeError::QueueClosed)?,
        };
        permit.forget();
        self.slots
            .lock()
            .pop_front()
            .ok_or_else(|| ComposeError::Pack {
                name: String::new(),
                reason: "slot permit granted with empty pool".to_string(),
            })
    }

    /// Return a slot for reuse without sealing it.
    pub fn enqueue_back(&self, slot: ArchiveSlot) {
        self.slots.lock().push_back(slot);
        self.available.add_permits(1);
    }

    /// Return a slot, sealing and replacing it if it reached the size threshold.
    pub async fn check_size_and_enqueue_back(&self, slot: ArchiveSlot) -> Result<()> {
        if slot.size() < self.size_threshold {
            self.enqueue_back(slot);
            return Ok(());
        }
        let fresh = ArchiveSlot::new(self.next_seq.fetch_add(1, Ordering::Relaxed));
        debug!(sealed = %slot.name, replacement = %fresh.name, size = slot.size(), "Slot reached threshold");
        self.enqueue_back(fresh);
        self.seal(slot).await
    }

    /// Drain the pool and seal every slot that holds entries.
    /// All slots must have been returned. Returns the names of the sealed archives.
    pub async fn finish(&self) -> Result<Vec<String>> {
        self.available.close();
        let slots: Vec<ArchiveSlot> = self.slots.lock().drain(..).collect();
        let mut sealed = Vec::new();
        for slot in slots.into_iter().filter(|s| !s.is_empty()) {
            let name = slot.name.clone();
            self.seal(slot).await?;
            sealed.push(name);
        }
        info!(archives = sealed.len(), "Archive pool finished");
        Ok(sealed)
    }

    /// Storage key of a sealed archive.
    pub fn archive_key(&self, name: &str) -> String {
        format!("{}/{}", self.archive_folder, name)
    }

    async fn seal(&self, slot: ArchiveSlot) -> Result<()> {
        let key = self.archive_key(&slot.name);
        let body = slot.writer.finish()?;
        let body = match &slot.crypter {
            Some(crypter) => crypter.encrypt(&key, body)?,
            None => body,
        };
        let size = body.len() as u64;
        self.store.write(&key, body).await?;
        self.stats.record_sealed(size);
        info!(archive = %key, size, "Archive sealed and uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::decode_entries;
    use crate::crypter::NoopCrypter;
    use crate::storage::MemoryObjectStore;
    use std::time::Duration;

    fn pool(slots: usize, threshold: u64) -> (ArchiveSlotPool, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new());
        let pool = ArchiveSlotPool::new(
            slots,
            threshold,
            "basebackups_005/b1/tar_partitions",
            store.clone(),
            Arc::new(ComposeStats::new()),
        );
        (pool, store)
    }

    fn write_file(slot: &mut ArchiveSlot, name: &str, size: usize) {
        slot.write_header(&ArchiveHeader::file(name, size as u64, 0o600, 0))
            .unwrap();
        slot.write_body(&vec![7u8; size]).unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_and_return() {
        let (pool, _) = pool(2, 1024);
        let cancel = CancellationToken::new();
        let a = pool.dequeue(&cancel).await.unwrap();
        let b = pool.dequeue(&cancel).await.unwrap();
        assert_ne!(a.name(), b.name());
        pool.enqueue_back(a);
        let c = pool.dequeue(&cancel).await.unwrap();
        assert_eq!(c.name(), "part_1.sar");
        pool.enqueue_back(b);
        pool.enqueue_back(c);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_cancelled() {
        let (pool, _) = pool(1, 1024);
        let cancel = CancellationToken::new();
        let _held = pool.dequeue(&cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = pool.dequeue(&cancel).await.unwrap_err();
        assert!(matches!(err, ComposeError::Cancelled));
    }

    #[tokio::test]
    async fn test_under_threshold_slot_is_reused() {
        let (pool, store) = pool(1, 1024);
        let cancel = CancellationToken::new();
        let mut slot = pool.dequeue(&cancel).await.unwrap();
        write_file(&mut slot, "a", 10);
        pool.check_size_and_enqueue_back(slot).await.unwrap();

        let slot = pool.dequeue(&cancel).await.unwrap();
        assert_eq!(slot.name(), "part_1.sar");
        assert!(!slot.is_empty());
        pool.enqueue_back(slot);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_full_slot_is_sealed_and_replaced() {
        let (pool, store) = pool(1, 100);
        let cancel = CancellationToken::new();
        let mut slot = pool.dequeue(&cancel).await.unwrap();
        slot.set_up(&(Arc::new(NoopCrypter) as Arc<dyn Crypter>));
        write_file(&mut slot, "big", 150);
        pool.check_size_and_enqueue_back(slot).await.unwrap();

        let key = "basebackups_005/b1/tar_partitions/part_1.sar";
        let entries = decode_entries(store.get(key).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.name, "big");

        let replacement = pool.dequeue(&cancel).await.unwrap();
        assert_eq!(replacement.name(), "part_2.sar");
        assert!(replacement.is_empty());
        pool.enqueue_back(replacement);
    }

    #[tokio::test]
    async fn test_finish_seals_only_non_empty_slots() {
        let (pool, store) = pool(3, 1 << 20);
        let cancel = CancellationToken::new();
        let mut slot = pool.dequeue(&cancel).await.unwrap();
        write_file(&mut slot, "only", 3);
        pool.enqueue_back(slot);

        let sealed = pool.finish().await.unwrap();
        assert_eq!(sealed, vec!["part_1.sar".to_string()]);
        assert_eq!(store.keys().len(), 1);

        let err = pool.dequeue(&cancel).await.unwrap_err();
        assert!(matches!(err, ComposeError::QueueClosed));
    }

    #[tokio::test]
    async fn test_seal_failure_propagates() {
        let (pool, store) = pool(1, 10);
        store.fail_writes_containing("tar_partitions");
        let cancel = CancellationToken::new();
        let mut slot = pool.dequeue(&cancel).await.unwrap();
        write_file(&mut slot, "x", 20);
        let err = pool.check_size_and_enqueue_back(slot).await.unwrap_err();
        assert!(matches!(err, ComposeError::Storage(_)));
        // the replacement is installed regardless
        let slot = pool.dequeue(&cancel).await.unwrap();
        assert_eq!(slot.name(), "part_2.sar");
        pool.enqueue_back(slot);
    }
}
