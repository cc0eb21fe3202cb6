//! Relfile classification: which data files are append-optimized segment
//! files eligible for deduplication, and where they live.

use std::collections::HashMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// OID of the default tablespace (`base/`).
pub const DEFAULT_TABLESPACE_OID: u32 = 1663;

/// OID of the shared catalog tablespace (`global/`).
pub const GLOBAL_TABLESPACE_OID: u32 = 1664;

/// Storage layout of an append-optimized relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelStorageType {
    /// Row-oriented append-optimized table
    AppendOptimized,
    /// Column-oriented append-optimized table
    ColumnOriented,
}

/// Physical identity of one relation segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelFileLocation {
    /// Tablespace OID
    pub spc_node: u32,
    /// Database OID
    pub db_node: u32,
    /// Relfilenode
    pub rel_node: u32,
    /// Segment number (the `.N` suffix, 0 when absent)
    pub seg_no: u32,
}

/// Catalog facts about an append-optimized segment file, gathered before the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoRelFileMetadata {
    /// MD5 of the qualified relation name; changes when the relation is rewritten
    pub rel_name_md5: String,
    /// Row or column oriented
    pub storage_type: RelStorageType,
    /// Logical end of file recorded in the segment catalog
    pub eof: u64,
    /// Modification counter recorded in the segment catalog
    pub mod_count: u64,
}

/// Result of classifying a local data file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelFileClass {
    /// Packed into an archive
    Regular,
    /// Dedup-eligible append-optimized segment file
    AppendOptimized {
        /// Catalog metadata for the segment file.
        meta: AoRelFileMetadata,
        /// Where the file lives.
        location: RelFileLocation,
    },
}

impl RelFileClass {
    /// True when the file may take the dedup path.
    pub fn is_dedup_eligible(&self) -> bool {
        matches!(self, RelFileClass::AppendOptimized { .. })
    }
}

/// Map of known append-optimized segment files, built from the segment catalogs.
#[derive(Debug, Clone, Default)]
pub struct RelStorageMap {
    files: HashMap<RelFileLocation, AoRelFileMetadata>,
}

impl RelStorageMap {
    /// Create an empty map (every file classifies as regular).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment file.
    pub fn insert(&mut self, location: RelFileLocation, meta: AoRelFileMetadata) {
        self.files.insert(location, meta);
    }

    /// Number of registered segment files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if no segment file is registered.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Classify a data file by path. Pure: depends only on the path and the map.
    pub fn classify(&self, path: &Path) -> RelFileClass {
        let Some(location) = parse_rel_file_location(path) else {
            return RelFileClass::Regular;
        };
        match self.files.get(&location) {
            Some(meta) => RelFileClass::AppendOptimized {
                meta: meta.clone(),
                location,
            },
            None => RelFileClass::Regular,
        }
    }
}

impl FromIterator<(RelFileLocation, AoRelFileMetadata)> for RelStorageMap {
    fn from_iter<I: IntoIterator<Item = (RelFileLocation, AoRelFileMetadata)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// Parse `.../base/<db>/<rel>[.<seg>]`, `.../global/<rel>[.<seg>]` or
/// `.../pg_tblspc/<spc>/<version>/<db>/<rel>[.<seg>]`.
/// Forks (`_fsm`, `_vm`, `_init`) and non-numeric names yield `None`.
pub fn parse_rel_file_location(path: &Path) -> Option<RelFileLocation> {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    let (file_name, dirs) = parts.split_last()?;
    let (rel_node, seg_no) = parse_rel_file_name(file_name)?;

    match dirs {
        [.., "global"] => Some(RelFileLocation {
            spc_node: GLOBAL_TABLESPACE_OID,
            db_node: 0,
            rel_node,
            seg_no,
        }),
        [.., "pg_tblspc", spc, _version, db] => Some(RelFileLocation {
            spc_node: spc.parse().ok()?,
            db_node: db.parse().ok()?,
            rel_node,
            seg_no,
        }),
        [.., "base", db] => Some(RelFileLocation {
            spc_node: DEFAULT_TABLESPACE_OID,
            db_node: db.parse().ok()?,
            rel_node,
            seg_no,
        }),
        _ => None,
    }
}

fn parse_rel_file_name(name: &str) -> Option<(u32, u32)> {
    let (rel, seg) = match name.split_once('.') {
        Some((rel, seg)) => (rel, seg.parse().ok()?),
        None => (name, 0),
    };
    if rel.is_empty() || !rel.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((rel.parse().ok()?, seg))
}
