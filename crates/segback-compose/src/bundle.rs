//! Per-run file bookkeeping: what was backed up, what was skipped, and which
//! archive holds which file.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveHeader;

/// What the restore side needs to know about one backed-up path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescription {
    /// File was stored as an increment against the base backup
    pub is_incremented: bool,
    /// File was deliberately excluded
    pub is_skipped: bool,
    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
    /// Size recorded in the header
    pub size: u64,
}

/// Records every file seen by the composer.
pub trait FileRecorder: Send + Sync {
    /// Record a file that is part of the backup.
    fn add_file(&self, header: &ArchiveHeader, is_incremented: bool);

    /// Record a file excluded from the backup.
    fn add_skipped(&self, header: &ArchiveHeader);

    /// Copy of everything recorded so far.
    fn files(&self) -> BTreeMap<String, FileDescription>;
}

/// Maps archives to their member files.
pub trait ArchiveIndex: Send {
    /// Register `file_name` as a member of `archive_name`.
    fn add_file(&mut self, archive_name: &str, file_name: &str);

    /// Archive holding `file_name`, if any.
    fn lookup(&self, file_name: &str) -> Option<String>;

    /// Serializable copy of the index.
    fn file_sets(&self) -> ArchiveFileSets;
}

/// Default [`FileRecorder`], a mutex-guarded ordered map.
#[derive(Debug, Default)]
pub struct RegularBundleFiles {
    files: Mutex<BTreeMap<String, FileDescription>>,
}

impl RegularBundleFiles {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileRecorder for RegularBundleFiles {
    fn add_file(&self, header: &ArchiveHeader, is_incremented: bool) {
        self.files.lock().insert(
            header.name.clone(),
            FileDescription {
                is_incremented,
                is_skipped: false,
                mtime: header.mtime,
                size: header.size,
            },
        );
    }

    fn add_skipped(&self, header: &ArchiveHeader) {
        self.files.lock().insert(
            header.name.clone(),
            FileDescription {
                is_incremented: false,
                is_skipped: true,
                mtime: header.mtime,
                size: header.size,
            },
        );
    }

    fn files(&self) -> BTreeMap<String, FileDescription> {
        self.files.lock().clone()
    }
}

/// Archive name to member files; the default [`ArchiveIndex`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFileSets {
    sets: BTreeMap<String, BTreeSet<String>>,
}

impl ArchiveFileSets {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of one archive.
    pub fn files_of(&self, archive_name: &str) -> Option<&BTreeSet<String>> {
        self.sets.get(archive_name)
    }

    /// Archive names in order.
    pub fn archives(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    /// Total number of registered files across all archives.
    pub fn file_count(&self) -> usize {
        self.sets.values().map(BTreeSet::len).sum()
    }
}

impl ArchiveIndex for ArchiveFileSets {
    fn add_file(&mut self, archive_name: &str, file_name: &str) {
        self.sets
            .entry(archive_name.to_string())
            .or_default()
            .insert(file_name.to_string());
    }

    fn lookup(&self, file_name: &str) -> Option<String> {
        self.sets
            .iter()
            .find(|(_, files)| files.contains(file_name))
            .map(|(archive, _)| archive.clone())
    }

    fn file_sets(&self) -> ArchiveFileSets {
        self.clone()
    }
}

/// The bundle record persisted next to the archives and read by restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    /// Every recorded path
    pub files: BTreeMap<String, FileDescription>,
    /// Archive membership
    pub archive_files: ArchiveFileSets,
}
