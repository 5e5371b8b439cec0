//! Error taxonomy for the backup/sync engine.
//!
//! Spec-relevant distinctions (see module docs on [`crate::engine`] and
//! [`crate::git`]): not-found and invalid-input fail fast and are never
//! recorded as a run failure if they occur before a run starts; transient
//! per-destination failures are folded into a combined message on the run's
//! history row; a cancelled lifecycle reclassifies any in-flight error as
//! `stopped` rather than `failed`.

use notesync_types::{BackupStatus, GitSyncStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NoteSyncError {
    #[error("vault not found: owner={owner} vault={vault}")]
    VaultNotFound { owner: i64, vault: String },

    #[error("backup config not found: id={0}")]
    ConfigNotFound(i64),

    #[error("storage destination not found: id={0}")]
    StorageNotFound(i64),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("destination {storage_id} failed: {source}")]
    Destination { storage_id: i64, #[source] source: anyhow::Error },

    #[error("local failure: {0}")]
    Local(#[source] anyhow::Error),

    #[error("run was cancelled")]
    Cancelled,

    #[error("shutdown timed out waiting for background work to drain")]
    ShutdownTimedOut,
}

impl NoteSyncError {
    /// Whether this error should fail the *caller's request* synchronously,
    /// before any run/history row is recorded (not-found, invalid input).
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            NoteSyncError::VaultNotFound { .. }
                | NoteSyncError::ConfigNotFound(_)
                | NoteSyncError::StorageNotFound(_)
                | NoteSyncError::InvalidInput(_)
        )
    }

    /// Maps a run-time error to the backup status it finalizes a history
    /// row and config with, honoring lifecycle cancellation (§7: "any error
    /// observed while lifecycle.Err() != nil is classified as stopped").
    pub fn backup_status(&self, lifecycle_cancelled: bool) -> BackupStatus {
        if lifecycle_cancelled || matches!(self, NoteSyncError::Cancelled) {
            return BackupStatus::Stopped;
        }
        BackupStatus::Failed
    }

    pub fn git_sync_status(&self, lifecycle_cancelled: bool) -> GitSyncStatus {
        if lifecycle_cancelled || matches!(self, NoteSyncError::Cancelled) {
            return GitSyncStatus::Stopped;
        }
        GitSyncStatus::Failed
    }
}

pub type Result<T> = std::result::Result<T, NoteSyncError>;
