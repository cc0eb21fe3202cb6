//! The unit of work handed to the composer by the discovery layer.

use std::path::PathBuf;

use crate::archive::ArchiveHeader;

/// A discovered file to be archived or deduplicated.
///
/// Moved into the submission queue and consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Local path to read content from
    pub path: PathBuf,
    /// Archive header; `header.name` is the file's identity within the backup
    pub header: ArchiveHeader,
    /// On-disk size at discovery time
    pub raw_size: u64,
    /// Content is an increment against the base backup
    pub is_incremented: bool,
}

impl FileDescriptor {
    /// Descriptor for a full (non-incremental) copy of a file.
    pub fn new(path: impl Into<PathBuf>, header: ArchiveHeader) -> Self {
        let raw_size = header.size;
        Self {
            path: path.into(),
            header,
            raw_size,
            is_incremented: false,
        }
    }
}
