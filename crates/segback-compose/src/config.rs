//! Configuration for a composition run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};

/// Default minimum size for a segment file to take the dedup path: 1 MiB.
pub const DEFAULT_AO_SEG_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// Default archive size at which a slot is sealed: 1 GiB.
pub const DEFAULT_ARCHIVE_SIZE_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// Default dedup age limit: 720 hours.
pub const DEFAULT_DEDUP_AGE_LIMIT_SECS: u64 = 720 * 3600;

/// Settings supplied by the bundling layer for one backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Segment files smaller than this are packed into archives even when dedup-eligible
    pub ao_seg_size_threshold: u64,
    /// Archive slots are sealed once their accumulated size reaches this
    pub archive_size_threshold: u64,
    /// A prior physical copy may be reused only if uploaded within this many seconds
    pub dedup_age_limit_secs: u64,
    /// Number of parallel workers (and depth of the submission queue)
    pub max_concurrency: usize,
    /// Number of archive slots cycling through the pool
    pub archive_slots: usize,
    /// Prefix holding backup sentinels and per-backup folders
    pub backup_prefix: String,
    /// Prefix holding deduplicated segment files, shared across backups
    pub segment_prefix: String,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            ao_seg_size_threshold: DEFAULT_AO_SEG_SIZE_THRESHOLD,
            archive_size_threshold: DEFAULT_ARCHIVE_SIZE_THRESHOLD,
            dedup_age_limit_secs: DEFAULT_DEDUP_AGE_LIMIT_SECS,
            max_concurrency: 1,
            archive_slots: 16,
            backup_prefix: "basebackups_005".to_string(),
            segment_prefix: String::new(),
        }
    }
}

impl ComposerConfig {
    /// Load from a `.toml` or `.json` file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ComposeError::io(path, e))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ComposerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| ComposeError::InvalidConfig(e.to_string()))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| ComposeError::InvalidConfig(e.to_string()))?,
            _ => {
                return Err(ComposeError::InvalidConfig(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or never seal.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ComposeError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.archive_slots == 0 {
            return Err(ComposeError::InvalidConfig(
                "archive_slots must be at least 1".to_string(),
            ));
        }
        if self.archive_size_threshold == 0 {
            return Err(ComposeError::InvalidConfig(
                "archive_size_threshold must be positive".to_string(),
            ));
        }
        if self.ao_seg_size_threshold == 0 {
            return Err(ComposeError::InvalidConfig(
                "ao_seg_size_threshold must be positive".to_string(),
            ));
        }
        if self.backup_prefix.is_empty() {
            return Err(ComposeError::InvalidConfig(
                "backup_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Dedup age limit as a duration.
    pub fn dedup_age_limit(&self) -> Duration {
        Duration::from_secs(self.dedup_age_limit_secs)
    }

    /// Folder of a named backup: `<backup_prefix>/<name>`.
    pub fn backup_folder(&self, backup_name: &str) -> String {
        format!("{}/{}", self.backup_prefix.trim_end_matches('/'), backup_name)
    }

    /// Folder of deduplicated segment files.
    pub fn aosegments_folder(&self) -> String {
        if self.segment_prefix.is_empty() {
            "aosegments".to_string()
        } else {
            format!("{}/aosegments", self.segment_prefix.trim_end_matches('/'))
        }
    }
}
