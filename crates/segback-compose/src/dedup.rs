//! Age-gated deduplication of append-optimized segment files.
//!
//! Segment files are stored as standalone objects outside the archives. When
//! the base backup's manifest already holds an unchanged, recent enough copy of
//! a file, the new backup references that copy instead of uploading it again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bundle::FileRecorder;
use crate::chain::ChainResolver;
use crate::classify::{AoRelFileMetadata, RelFileLocation, RelStorageType};
use crate::crypter::Crypter;
use crate::descriptor::FileDescriptor;
use crate::error::{ComposeError, Result};
use crate::stats::ComposeStats;
use crate::storage::{ObjectStore, StorageError};

/// Name of the per-backup dedup manifest object.
pub const AO_FILES_METADATA_NAME: &str = "ao_files_metadata.json";

/// Source of "now" for age checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Manifest entry for one segment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoFileDesc {
    /// Object name under the segment folder holding the physical copy
    pub storage_key: String,
    /// Relfile identity of the copy
    pub location: RelFileLocation,
    /// Relation name hash at upload time
    pub rel_name_md5: String,
    /// Row or column oriented
    pub storage_type: RelStorageType,
    /// Logical size recorded at upload time
    pub eof: u64,
    /// Modification counter recorded at upload time
    pub mod_count: u64,
    /// File modification time, seconds since the Unix epoch
    pub mtime: i64,
    /// Unix file mode
    pub file_mode: u32,
    /// BLAKE3 of the uploaded content
    pub fingerprint: String,
    /// Backup that uploaded the physical copy
    pub owner_backup: String,
    /// True when this run reused the copy instead of uploading it
    pub is_skipped: bool,
    /// When the physical copy was first uploaded; carried forward on reuse
    pub initial_upload_ts: DateTime<Utc>,
}

/// Serialized dedup manifest of one backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoFilesMetadata {
    /// Entries keyed by archive name of the file
    pub files: BTreeMap<String, AoFileDesc>,
}

/// Why a base entry could not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseMiss {
    /// Base manifest has no entry for the file
    NotInBase,
    /// Base copy was uploaded before the age limit
    TooOld,
    /// Location, relation hash, size or modification counter differ
    Changed,
}

/// Decides reuse vs. upload for dedup-eligible files and accumulates the manifest.
pub struct DedupUploader {
    store: Arc<dyn ObjectStore>,
    crypter: Arc<dyn Crypter>,
    recorder: Arc<dyn FileRecorder>,
    stats: Arc<ComposeStats>,
    base_files: BTreeMap<String, AoFileDesc>,
    files: Mutex<BTreeMap<String, AoFileDesc>>,
    age_limit: chrono::Duration,
    backup_name: String,
    run_id: String,
    aosegments_folder: String,
    clock: Clock,
}

impl DedupUploader {
    /// Create an uploader diffing against `base_files`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        crypter: Arc<dyn Crypter>,
        recorder: Arc<dyn FileRecorder>,
        stats: Arc<ComposeStats>,
        base_files: BTreeMap<String, AoFileDesc>,
        age_limit: Duration,
        backup_name: impl Into<String>,
        aosegments_folder: impl Into<String>,
        clock: Clock,
    ) -> Result<Self> {
        let age_limit = chrono::Duration::from_std(age_limit)
            .map_err(|e| ComposeError::InvalidConfig(format!("dedup age limit: {}", e)))?;
        let run_id = clock().timestamp_nanos_opt().unwrap_or_default().to_string();
        Ok(Self {
            store,
            crypter,
            recorder,
            stats,
            base_files,
            files: Mutex::new(BTreeMap::new()),
            age_limit,
            backup_name: backup_name.into(),
            run_id,
            aosegments_folder: aosegments_folder.into(),
            clock,
        })
    }

    /// Reuse the base copy of the file or upload it fresh.
    pub async fn add_file(
        &self,
        descriptor: &FileDescriptor,
        meta: &AoRelFileMetadata,
        location: &RelFileLocation,
    ) -> Result<()> {
        let now = (self.clock)();
        match self.reusable_entry(&descriptor.header.name, meta, location, now) {
            Ok(base) => {
                self.skip_upload(descriptor, base);
                Ok(())
            }
            Err(miss) => {
                debug!(file = %descriptor.header.name, reason = ?miss, "Segment file needs upload");
                self.regular_upload(descriptor, meta, location, now).await
            }
        }
    }

    /// Base entry for `name` if every reuse condition holds.
    /// An entry uploaded exactly `age_limit` ago is still reusable.
    pub fn reusable_entry(
        &self,
        name: &str,
        meta: &AoRelFileMetadata,
        location: &RelFileLocation,
        now: DateTime<Utc>,
    ) -> std::result::Result<&AoFileDesc, ReuseMiss> {
        let base = self.base_files.get(name).ok_or(ReuseMiss::NotInBase)?;
        // a cutoff before the earliest representable time keeps every entry fresh
        if let Some(cutoff) = now.checked_sub_signed(self.age_limit) {
            if base.initial_upload_ts < cutoff {
                return Err(ReuseMiss::TooOld);
            }
        }
        if base.location != *location
            || base.rel_name_md5 != meta.rel_name_md5
            || base.eof != meta.eof
            || base.mod_count != meta.mod_count
        {
            return Err(ReuseMiss::Changed);
        }
        Ok(base)
    }

    fn skip_upload(&self, descriptor: &FileDescriptor, base: &AoFileDesc) {
        let mut entry = base.clone();
        entry.is_skipped = true;
        self.files.lock().insert(descriptor.header.name.clone(), entry);
        self.recorder.add_file(&descriptor.header, false);
        self.stats.record_reused(base.eof);
        debug!(file = %descriptor.header.name, storage_key = %base.storage_key, "Reusing segment file from base backup");
    }

    async fn regular_upload(
        &self,
        descriptor: &FileDescriptor,
        meta: &AoRelFileMetadata,
        location: &RelFileLocation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let content = tokio::fs::read(&descriptor.path)
            .await
            .map_err(|e| ComposeError::io(&descriptor.path, e))?;
        let fingerprint = blake3::hash(&content).to_hex().to_string();
        let storage_key = self.storage_key(meta, location);
        let object_key = format!("{}/{}", self.aosegments_folder, storage_key);
        let size = content.len() as u64;
        let body = self.crypter.encrypt(&object_key, Bytes::from(content))?;
        self.store.write(&object_key, body).await?;

        let entry = AoFileDesc {
            storage_key,
            location: *location,
            rel_name_md5: meta.rel_name_md5.clone(),
            storage_type: meta.storage_type,
            eof: meta.eof,
            mod_count: meta.mod_count,
            mtime: descriptor.header.mtime,
            file_mode: descriptor.header.mode,
            fingerprint,
            owner_backup: self.backup_name.clone(),
            is_skipped: false,
            initial_upload_ts: now,
        };
        self.files.lock().insert(descriptor.header.name.clone(), entry);
        self.recorder.add_file(&descriptor.header, false);
        self.stats.record_uploaded(size);
        debug!(file = %descriptor.header.name, key = %object_key, size, "Uploaded segment file");
        Ok(())
    }

    fn storage_key(&self, meta: &AoRelFileMetadata, location: &RelFileLocation) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_{}_aoseg",
            location.spc_node,
            location.db_node,
            meta.rel_name_md5,
            location.rel_node,
            location.seg_no,
            meta.mod_count,
            self.run_id
        )
    }

    /// The full accumulated manifest.
    pub fn get_files(&self) -> AoFilesMetadata {
        AoFilesMetadata {
            files: self.files.lock().clone(),
        }
    }

    /// Number of base entries available for reuse.
    pub fn base_len(&self) -> usize {
        self.base_files.len()
    }
}

/// Key of a backup's dedup manifest.
pub fn ao_files_metadata_key(backup_folder: &str) -> String {
    format!("{}/{}", backup_folder, AO_FILES_METADATA_NAME)
}

/// Load the manifest this run diffs against.
///
/// The base is `increment_from` when given, else the latest backup. No backups
/// at all, or a base without a manifest, yield an empty base.
pub async fn load_base_files(
    resolver: &ChainResolver,
    store: &dyn ObjectStore,
    increment_from: Option<&str>,
) -> Result<BTreeMap<String, AoFileDesc>> {
    let base_name = match increment_from.filter(|name| !name.is_empty()) {
        Some(name) => {
            let chain = resolver.resolve(name).await?;
            info!(base = name, root = %chain.base_backup_name, "Using increment base for segment dedup");
            name.to_string()
        }
        None => match resolver.latest_backup().await {
            Ok(latest) => {
                info!(base = %latest.name, "Using latest backup for segment dedup");
                latest.name
            }
            Err(ComposeError::NoBackupsFound { .. }) => {
                info!("Couldn't find previous backup, leaving the base files empty");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e),
        },
    };

    let key = ao_files_metadata_key(&resolver.backup_folder(&base_name));
    match store.read(&key).await {
        Ok(data) => {
            let manifest: AoFilesMetadata = serde_json::from_slice(&data)?;
            info!(base = %base_name, entries = manifest.files.len(), "Loaded base segment manifest");
            Ok(manifest.files)
        }
        Err(StorageError::NotFound { .. }) => {
            warn!(base = %base_name, "Segment manifest was not found for base backup, leaving the base files empty");
            Ok(BTreeMap::new())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveHeader;
    use crate::bundle::RegularBundleFiles;
    use crate::classify::DEFAULT_TABLESPACE_OID;
    use crate::crypter::NoopCrypter;
    use crate::storage::MemoryObjectStore;
    use chrono::TimeZone;

    const AGE_LIMIT_SECS: u64 = 3600;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
    }

    fn location() -> RelFileLocation {
        RelFileLocation {
            spc_node: DEFAULT_TABLESPACE_OID,
            db_node: 16384,
            rel_node: 24576,
            seg_no: 1,
        }
    }

    fn meta() -> AoRelFileMetadata {
        AoRelFileMetadata {
            rel_name_md5: "abc".to_string(),
            storage_type: RelStorageType::AppendOptimized,
            eof: 11,
            mod_count: 2,
        }
    }

    fn base_entry(uploaded: DateTime<Utc>) -> AoFileDesc {
        AoFileDesc {
            storage_key: "1663_16384_abc_24576_1_2_1_aoseg".to_string(),
            location: location(),
            rel_name_md5: "abc".to_string(),
            storage_type: RelStorageType::AppendOptimized,
            eof: 11,
            mod_count: 2,
            mtime: 0,
            file_mode: 0o600,
            fingerprint: String::new(),
            owner_backup: "base_000".to_string(),
            is_skipped: false,
            initial_upload_ts: uploaded,
        }
    }

    fn uploader(
        base: BTreeMap<String, AoFileDesc>,
        store: Arc<MemoryObjectStore>,
    ) -> (DedupUploader, Arc<ComposeStats>) {
        let stats = Arc::new(ComposeStats::new());
        let uploader = DedupUploader::new(
            store,
            Arc::new(NoopCrypter),
            Arc::new(RegularBundleFiles::new()),
            stats.clone(),
            base,
            Duration::from_secs(AGE_LIMIT_SECS),
            "base_001",
            "aosegments",
            Arc::new(now),
        )
        .unwrap();
        (uploader, stats)
    }

    fn descriptor(dir: &tempfile::TempDir) -> FileDescriptor {
        let path = dir.path().join("24576.1");
        std::fs::write(&path, b"ao contents").unwrap();
        FileDescriptor::new(path, ArchiveHeader::file("base/16384/24576.1", 11, 0o600, 7))
    }

    fn base_with(entry: AoFileDesc) -> BTreeMap<String, AoFileDesc> {
        [("base/16384/24576.1".to_string(), entry)].into_iter().collect()
    }

    #[test]
    fn test_age_boundary_is_inclusive() {
        let limit = chrono::Duration::seconds(AGE_LIMIT_SECS as i64);
        let store = Arc::new(MemoryObjectStore::new());

        let (at_limit, _) = uploader(base_with(base_entry(now() - limit)), store.clone());
        assert!(at_limit
            .reusable_entry("base/16384/24576.1", &meta(), &location(), now())
            .is_ok());

        let past = now() - limit - chrono::Duration::seconds(1);
        let (past_limit, _) = uploader(base_with(base_entry(past)), store);
        assert_eq!(
            past_limit
                .reusable_entry("base/16384/24576.1", &meta(), &location(), now())
                .unwrap_err(),
            ReuseMiss::TooOld
        );
    }

    #[test]
    fn test_age_limit_beyond_calendar_keeps_entries_fresh() {
        let store = Arc::new(MemoryObjectStore::new());
        let stats = Arc::new(ComposeStats::new());
        let u = DedupUploader::new(
            store,
            Arc::new(NoopCrypter),
            Arc::new(RegularBundleFiles::new()),
            stats,
            base_with(base_entry(now() - chrono::Duration::days(365 * 100))),
            Duration::from_secs(10_000_000_000_000),
            "base_001",
            "aosegments",
            Arc::new(now),
        )
        .unwrap();

        assert!(u
            .reusable_entry("base/16384/24576.1", &meta(), &location(), now())
            .is_ok());
    }

    #[test]
    fn test_changed_file_is_not_reused() {
        let store = Arc::new(MemoryObjectStore::new());
        let (u, _) = uploader(base_with(base_entry(now())), store);

        let mut grown = meta();
        grown.eof = 12;
        assert_eq!(
            u.reusable_entry("base/16384/24576.1", &grown, &location(), now()).unwrap_err(),
            ReuseMiss::Changed
        );
        let mut rewritten = meta();
        rewritten.mod_count = 3;
        assert_eq!(
            u.reusable_entry("base/16384/24576.1", &rewritten, &location(), now()).unwrap_err(),
            ReuseMiss::Changed
        );
        let mut moved = location();
        moved.seg_no = 2;
        assert_eq!(
            u.reusable_entry("base/16384/24576.1", &meta(), &moved, now()).unwrap_err(),
            ReuseMiss::Changed
        );
        assert_eq!(
            u.reusable_entry("base/16384/99999", &meta(), &location(), now()).unwrap_err(),
            ReuseMiss::NotInBase
        );
    }

    #[tokio::test]
    async fn test_reuse_copies_entry_forward_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let uploaded = now() - chrono::Duration::seconds(10);
        let (u, stats) = uploader(base_with(base_entry(uploaded)), store.clone());

        u.add_file(&descriptor(&dir), &meta(), &location()).await.unwrap();

        assert_eq!(store.stats().writes, 0);
        let files = u.get_files().files;
        let entry = &files["base/16384/24576.1"];
        assert!(entry.is_skipped);
        assert_eq!(entry.owner_backup, "base_000");
        assert_eq!(entry.initial_upload_ts, uploaded);
        assert_eq!(stats.snapshot().segments_reused, 1);
    }

    #[tokio::test]
    async fn test_fresh_upload_records_new_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let (u, stats) = uploader(BTreeMap::new(), store.clone());

        u.add_file(&descriptor(&dir), &meta(), &location()).await.unwrap();

        let files = u.get_files().files;
        let entry = &files["base/16384/24576.1"];
        assert!(!entry.is_skipped);
        assert_eq!(entry.owner_backup, "base_001");
        assert_eq!(entry.initial_upload_ts, now());
        assert_eq!(entry.fingerprint, blake3::hash(b"ao contents").to_hex().as_str());
        let key = format!("aosegments/{}", entry.storage_key);
        assert_eq!(store.get(&key).unwrap(), Bytes::from_static(b"ao contents"));
        assert_eq!(stats.snapshot().segments_uploaded, 1);
    }

    #[tokio::test]
    async fn test_upload_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_writes_containing("aosegments");
        let (u, _) = uploader(BTreeMap::new(), store);

        let err = u.add_file(&descriptor(&dir), &meta(), &location()).await.unwrap_err();
        assert!(matches!(err, ComposeError::Storage(StorageError::Backend(_))));
        assert!(u.get_files().files.is_empty());
    }

    #[tokio::test]
    async fn test_stale_entry_is_uploaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let stale = now() - chrono::Duration::seconds(AGE_LIMIT_SECS as i64 + 1);
        let (u, _) = uploader(base_with(base_entry(stale)), store.clone());

        u.add_file(&descriptor(&dir), &meta(), &location()).await.unwrap();
        assert_eq!(store.stats().writes, 1);
        assert!(!u.get_files().files["base/16384/24576.1"].is_skipped);
    }
}
