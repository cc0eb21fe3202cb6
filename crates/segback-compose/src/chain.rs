//! Backup chain resolution.
//!
//! Every finished backup leaves a sentinel object naming the backup it was
//! taken as an increment from and the full backup at the root of its chain.
//! [`ChainResolver`] reads sentinels to answer "is this a full backup, and if
//! not, what does it build on".

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{ComposeError, Result};
use crate::storage::{ObjectInfo, ObjectStore};

/// Suffix of sentinel objects under the backup prefix.
pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";

/// Upper bound on predecessor hops before a chain is considered broken.
pub const MAX_CHAIN_HOPS: usize = 1024;

/// Chain linkage recorded when a backup finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSentinel {
    /// Backup this one was taken as an increment from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_from: Option<String>,
    /// Full backup at the root of the chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_full_name: Option<String>,
    /// When the backup started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the backup finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
}

impl BackupSentinel {
    /// Sentinel of a full backup.
    pub fn full() -> Self {
        Self::default()
    }

    /// Sentinel of an increment from `predecessor` whose chain starts at `root`.
    pub fn incremental(predecessor: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            increment_from: Some(predecessor.into()),
            increment_full_name: Some(root.into()),
            ..Self::default()
        }
    }

    fn predecessor(&self) -> Option<&str> {
        self.increment_from.as_deref().filter(|s| !s.is_empty())
    }

    fn root(&self) -> Option<&str> {
        self.increment_full_name.as_deref().filter(|s| !s.is_empty())
    }

    /// True if the backup is incremental. Fails when only one link is set.
    pub fn is_incremental(&self, backup: &str) -> Result<bool> {
        match (self.predecessor(), self.root()) {
            (None, None) => Ok(false),
            (Some(_), Some(_)) => Ok(true),
            (Some(_), None) => Err(ComposeError::InvalidSentinel {
                backup: backup.to_string(),
                reason: "increment_from set without increment_full_name".to_string(),
            }),
            (None, Some(_)) => Err(ComposeError::InvalidSentinel {
                backup: backup.to_string(),
                reason: "increment_full_name set without increment_from".to_string(),
            }),
        }
    }
}

/// Resolved chain fields of one backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Backup is a full backup
    pub is_full: bool,
    /// Root full backup; empty for full backups
    pub base_backup_name: String,
    /// Immediate predecessor; empty for full backups
    pub increment_from_name: String,
}

impl ChainInfo {
    fn full() -> Self {
        Self {
            is_full: true,
            ..Self::default()
        }
    }
}

/// A storage listing entry paired with its resolved chain fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupObject {
    name: String,
    last_modified: DateTime<Utc>,
    size: u64,
    storage: String,
    chain: ChainInfo,
}

impl BackupObject {
    /// Pair a listing entry with already resolved chain fields.
    pub fn new(name: impl Into<String>, entry: &ObjectInfo, chain: ChainInfo) -> Self {
        Self {
            name: name.into(),
            last_modified: entry.last_modified,
            size: entry.size,
            storage: entry.storage.clone(),
            chain,
        }
    }

    /// Backup name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sentinel modification time.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Sentinel size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Storage holding the backup.
    pub fn storage(&self) -> &str {
        &self.storage
    }

    /// True for full backups.
    pub fn is_full_backup(&self) -> bool {
        self.chain.is_full
    }

    /// Root full backup name; empty for full backups.
    pub fn base_backup_name(&self) -> &str {
        &self.chain.base_backup_name
    }

    /// Immediate predecessor name; empty for full backups.
    pub fn increment_from_name(&self) -> &str {
        &self.chain.increment_from_name
    }
}

/// The most recent backup under a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestBackup {
    /// Backup name
    pub name: String,
    /// Sentinel modification time
    pub last_modified: DateTime<Utc>,
}

/// Loads sentinels and resolves chain linkage.
pub struct ChainResolver {
    store: Arc<dyn ObjectStore>,
    backup_prefix: String,
}

impl ChainResolver {
    /// Create a resolver for sentinels stored under `backup_prefix`.
    pub fn new(store: Arc<dyn ObjectStore>, backup_prefix: impl Into<String>) -> Self {
        let backup_prefix = backup_prefix.into().trim_end_matches('/').to_string();
        Self {
            store,
            backup_prefix,
        }
    }

    /// Key of a backup's sentinel.
    pub fn sentinel_key(&self, backup_name: &str) -> String {
        format!("{}/{}{}", self.backup_prefix, backup_name, SENTINEL_SUFFIX)
    }

    /// Folder holding a backup's objects.
    pub fn backup_folder(&self, backup_name: &str) -> String {
        format!("{}/{}", self.backup_prefix, backup_name)
    }

    /// Backup name of a sentinel key directly under the prefix.
    pub fn backup_name_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(&self.backup_prefix)?.strip_prefix('/')?;
        let name = rest.strip_suffix(SENTINEL_SUFFIX)?;
        (!name.is_empty() && !name.contains('/')).then_some(name)
    }

    /// Read and decode a backup's sentinel.
    pub async fn load_sentinel(&self, backup_name: &str) -> Result<BackupSentinel> {
        let data = self.store.read(&self.sentinel_key(backup_name)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Resolve {is_full, root full backup, immediate predecessor} of a backup.
    #[instrument(skip(self))]
    pub async fn resolve(&self, backup_name: &str) -> Result<ChainInfo> {
        let sentinel = self.load_sentinel(backup_name).await?;
        Self::chain_of(backup_name, &sentinel)
    }

    fn chain_of(backup_name: &str, sentinel: &BackupSentinel) -> Result<ChainInfo> {
        if !sentinel.is_incremental(backup_name)? {
            return Ok(ChainInfo::full());
        }
        Ok(ChainInfo {
            is_full: false,
            base_backup_name: sentinel.root().unwrap_or_default().to_string(),
            increment_from_name: sentinel.predecessor().unwrap_or_default().to_string(),
        })
    }

    /// Walk predecessor links to the full backup at the root of the chain.
    /// Fails on cycles, on chains longer than [`MAX_CHAIN_HOPS`], and when the
    /// walked root differs from the root recorded in the starting sentinel.
    pub async fn resolve_root(&self, backup_name: &str) -> Result<String> {
        let start = self.resolve(backup_name).await?;
        if start.is_full {
            return Ok(backup_name.to_string());
        }

        let mut visited = HashSet::from([backup_name.to_string()]);
        let mut current = start.increment_from_name.clone();
        for _ in 0..MAX_CHAIN_HOPS {
            if !visited.insert(current.clone()) {
                return Err(ComposeError::BrokenChain {
                    backup: current,
                    reason: "cycle in predecessor links".to_string(),
                });
            }
            let chain = self.resolve(&current).await?;
            if chain.is_full {
                if current != start.base_backup_name {
                    return Err(ComposeError::BrokenChain {
                        backup: backup_name.to_string(),
                        reason: format!(
                            "recorded root {} but chain ends at {}",
                            start.base_backup_name, current
                        ),
                    });
                }
                return Ok(current);
            }
            debug!(backup = %current, predecessor = %chain.increment_from_name, "Following chain");
            current = chain.increment_from_name;
        }
        Err(ComposeError::BrokenChain {
            backup: backup_name.to_string(),
            reason: format!("no full backup within {} hops", MAX_CHAIN_HOPS),
        })
    }

    /// Sentinel listing entries with their backup names.
    async fn list_sentinels(&self) -> Result<Vec<(String, ObjectInfo)>> {
        let prefix = format!("{}/", self.backup_prefix);
        let listing = self.store.list(&prefix).await?;
        Ok(listing
            .into_iter()
            .filter_map(|obj| {
                let name = self.backup_name_from_key(&obj.key)?.to_string();
                Some((name, obj))
            })
            .collect())
    }

    /// The backup whose sentinel was modified last.
    pub async fn latest_backup(&self) -> Result<LatestBackup> {
        self.list_sentinels()
            .await?
            .into_iter()
            .max_by(|(a_name, a), (b_name, b)| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a_name.cmp(b_name))
            })
            .map(|(name, obj)| LatestBackup {
                name,
                last_modified: obj.last_modified,
            })
            .ok_or_else(|| ComposeError::NoBackupsFound {
                prefix: self.backup_prefix.clone(),
            })
    }

    /// Build [`BackupObject`]s for every backup under the prefix, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupObject>> {
        let mut sentinels = self.list_sentinels().await?;
        sentinels.sort_by(|(_, a), (_, b)| a.last_modified.cmp(&b.last_modified));
        self.make_backup_objects(&sentinels).await
    }

    /// Resolve chain fields for each listed sentinel.
    pub async fn make_backup_objects(
        &self,
        sentinels: &[(String, ObjectInfo)],
    ) -> Result<Vec<BackupObject>> {
        let mut objects = Vec::with_capacity(sentinels.len());
        for (name, entry) in sentinels {
            let chain = self.resolve(name).await?;
            objects.push(BackupObject::new(name.clone(), entry, chain));
        }
        Ok(objects)
    }
}
