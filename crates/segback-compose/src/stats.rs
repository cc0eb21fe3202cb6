//! Run counters for the composition pipeline.
//!
//! Updated lock-free from workers, sub-tasks and the dedup uploader.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by every component of one run.
#[derive(Debug, Default)]
pub struct ComposeStats {
    files_packed: AtomicU64,
    headers_written: AtomicU64,
    files_skipped: AtomicU64,
    segments_reused: AtomicU64,
    segments_uploaded: AtomicU64,
    archives_sealed: AtomicU64,
    bytes_archived: AtomicU64,
    bytes_reused: AtomicU64,
    bytes_uploaded: AtomicU64,
}

/// Point-in-time copy of [`ComposeStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeStatsSnapshot {
    /// Regular files packed into archives.
    pub files_packed: u64,
    /// Metadata-only entries written.
    pub headers_written: u64,
    /// Files excluded from the backup.
    pub files_skipped: u64,
    /// Segment files whose prior copy was reused.
    pub segments_reused: u64,
    /// Segment files uploaded fresh.
    pub segments_uploaded: u64,
    /// Archives sealed and uploaded.
    pub archives_sealed: u64,
    /// Sealed archive bytes uploaded.
    pub bytes_archived: u64,
    /// Segment bytes not re-uploaded thanks to reuse.
    pub bytes_reused: u64,
    /// Segment bytes uploaded fresh.
    pub bytes_uploaded: u64,
}

impl ComposeStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_packed(&self) {
        self.files_packed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_header(&self) {
        self.headers_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reused(&self, bytes: u64) {
        self.segments_reused.fetch_add(1, Ordering::Relaxed);
        self.bytes_reused.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_uploaded(&self, bytes: u64) {
        self.segments_uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_sealed(&self, bytes: u64) {
        self.archives_sealed.fetch_add(1, Ordering::Relaxed);
        self.bytes_archived.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> ComposeStatsSnapshot {
        ComposeStatsSnapshot {
            files_packed: self.files_packed.load(Ordering::Relaxed),
            headers_written: self.headers_written.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            segments_reused: self.segments_reused.load(Ordering::Relaxed),
            segments_uploaded: self.segments_uploaded.load(Ordering::Relaxed),
            archives_sealed: self.archives_sealed.load(Ordering::Relaxed),
            bytes_archived: self.bytes_archived.load(Ordering::Relaxed),
            bytes_reused: self.bytes_reused.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}
