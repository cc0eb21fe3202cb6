//! Error types for the composition core

use crate::storage::StorageError;

/// Result type alias for composition operations.
pub type Result<T> = std::result::Result<T, ComposeError>;

/// All errors that can occur while composing a backup.
///
/// Errors are `Clone` so the first failure of a run can be reported both to
/// `add_header` callers and to `finish_composing`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComposeError {
    /// Configuration rejected before any worker started
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The run was cancelled while an operation was blocked
    #[error("Composition cancelled")]
    Cancelled,
    /// Submission attempted after `finish_composing` closed the queue
    #[error("Submission queue is closed")]
    QueueClosed,
    /// No backup exists under the backup prefix
    #[error("No backups found under {prefix}")]
    NoBackupsFound {
        /// Prefix that was listed.
        prefix: String,
    },
    /// A sentinel violates the chain record invariants
    #[error("Invalid sentinel for backup {backup}: {reason}")]
    InvalidSentinel {
        /// Backup whose sentinel was rejected.
        backup: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Walking predecessor links did not reach a full backup
    #[error("Broken backup chain at {backup}: {reason}")]
    BrokenChain {
        /// Backup where the walk stopped.
        backup: String,
        /// Cycle or hop limit description.
        reason: String,
    },
    /// Object store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// Local file I/O failure
    #[error("I/O error on {path}: {reason}")]
    Io {
        /// Local path being read.
        path: String,
        /// Underlying error text.
        reason: String,
    },
    /// Packing a file into an archive failed
    #[error("Failed to pack {name}: {reason}")]
    Pack {
        /// Archive entry name.
        name: String,
        /// Cause.
        reason: String,
    },
    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ComposeError {
    /// True for the "object absent" class that callers may recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ComposeError::Storage(StorageError::NotFound { .. }) | ComposeError::NoBackupsFound { .. }
        )
    }

    pub(crate) fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        ComposeError::Io {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ComposeError {
    fn from(err: serde_json::Error) -> Self {
        ComposeError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ComposeError {
    fn from(err: bincode::Error) -> Self {
        ComposeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classes() {
        let err = ComposeError::Storage(StorageError::NotFound {
            key: "b/ao_files_metadata.json".to_string(),
        });
        assert!(err.is_not_found());
        let err = ComposeError::NoBackupsFound {
            prefix: "basebackups_005/".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!ComposeError::Cancelled.is_not_found());
        let err = ComposeError::Storage(StorageError::Backend("timeout".to_string()));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(format!("{}", ComposeError::Cancelled), "Composition cancelled");
        let err = ComposeError::Pack {
            name: "base/1/2".to_string(),
            reason: "short read".to_string(),
        };
        assert_eq!(format!("{}", err), "Failed to pack base/1/2: short read");
    }

    #[test]
    fn test_io_helper_keeps_path() {
        let err = ComposeError::io(
            "/data/base/1/2",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = format!("{}", err);
        assert!(msg.contains("/data/base/1/2"));
        assert!(msg.contains("gone"));
    }
}
