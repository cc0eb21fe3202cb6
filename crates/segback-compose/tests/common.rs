//! Shared fixtures for composition integration tests.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use segback_compose::chain::SENTINEL_SUFFIX;
use segback_compose::{
    AoRelFileMetadata, ArchiveHeader, BackupSentinel, FileDescriptor, MemoryObjectStore,
    RelFileLocation, RelStorageMap, RelStorageType,
};

pub const DB_OID: u32 = 16384;

/// Fixed "now" of every test run.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("segback_compose=debug")
        .with_test_writer()
        .try_init();
}

/// A scratch data directory whose files are addressed by archive name.
pub struct DataDir {
    dir: tempfile::TempDir,
}

impl DataDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create `name` with `size` bytes and return its descriptor.
    pub fn file(&self, name: &str, size: usize) -> FileDescriptor {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, content).unwrap();
        FileDescriptor::new(path, ArchiveHeader::file(name, size as u64, 0o600, 1_700_000_000))
    }

    /// Descriptor of a file that was never created.
    pub fn missing(&self, name: &str, size: u64) -> FileDescriptor {
        let path: PathBuf = self.dir.path().join(name);
        FileDescriptor::new(path, ArchiveHeader::file(name, size, 0o600, 0))
    }
}

pub fn ao_location(rel: u32, seg: u32) -> RelFileLocation {
    RelFileLocation {
        spc_node: 1663,
        db_node: DB_OID,
        rel_node: rel,
        seg_no: seg,
    }
}

pub fn ao_meta(eof: u64) -> AoRelFileMetadata {
    AoRelFileMetadata {
        rel_name_md5: "5f1d7a".to_string(),
        storage_type: RelStorageType::AppendOptimized,
        eof,
        mod_count: 1,
    }
}

/// Archive name of an append-optimized segment file.
pub fn ao_name(rel: u32, seg: u32) -> String {
    format!("base/{}/{}.{}", DB_OID, rel, seg)
}

pub fn rel_storage(entries: &[(u32, u32, u64)]) -> RelStorageMap {
    entries
        .iter()
        .map(|&(rel, seg, eof)| (ao_location(rel, seg), ao_meta(eof)))
        .collect()
}

pub fn put_sentinel(store: &MemoryObjectStore, name: &str, sentinel: &BackupSentinel, at: DateTime<Utc>) {
    let key = format!("basebackups_005/{}{}", name, SENTINEL_SUFFIX);
    store.insert_at(&key, Bytes::from(serde_json::to_vec(sentinel).unwrap()), at);
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
