#![warn(missing_docs)]

//! Segment backup composition: bounded archive streaming, age-gated segment dedup, backup chain resolution
//!
//! Submit path: FileDescriptor → Queue → Worker → Classify → (Dedup upload | Slot → Pack → Seal → Store)
//! Finish path: Close queue → Join workers → Seal remaining slots → Persist manifest

pub mod archive;
pub mod bundle;
pub mod chain;
pub mod classify;
pub mod composer;
pub mod config;
pub mod crypter;
pub mod dedup;
pub mod descriptor;
pub mod error;
pub mod packer;
pub mod slot_pool;
pub mod stats;
pub mod storage;
pub mod task_group;

pub use archive::{decode_entries, ArchiveHeader, ArchiveWriter};
pub use bundle::{ArchiveFileSets, ArchiveIndex, BundleRecord, FileDescription, FileRecorder, RegularBundleFiles};
pub use chain::{BackupObject, BackupSentinel, ChainInfo, ChainResolver, LatestBackup};
pub use classify::{AoRelFileMetadata, RelFileClass, RelFileLocation, RelStorageMap, RelStorageType};
pub use composer::{ArchiveComposer, ComposerBuilder};
pub use config::ComposerConfig;
pub use crypter::{Crypter, NoopCrypter};
pub use dedup::{AoFileDesc, AoFilesMetadata, Clock, DedupUploader};
pub use descriptor::FileDescriptor;
pub use error::{ComposeError, Result};
pub use packer::FilePacker;
pub use slot_pool::{ArchiveSlot, ArchiveSlotPool};
pub use stats::{ComposeStats, ComposeStatsSnapshot};
pub use storage::{MemoryObjectStore, ObjectInfo, ObjectStore, StorageError};
pub use task_group::TaskGroup;
