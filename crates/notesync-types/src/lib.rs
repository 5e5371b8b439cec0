//! # Types
//!
//! Core domain types shared across the notesync workspace: vaults, notes,
//! files, folders, backup/git-sync configuration, history rows, and shares.
//!
//! This module defines the fundamental data structures described by the
//! system's data model:
//! - [`Vault`], [`Note`], [`File`], [`Folder`] - the resources being backed up
//! - [`BackupConfig`] / [`BackupHistory`] - scheduled archive/mirror exports
//! - [`GitSyncConfig`] / [`GitSyncHistory`] - git mirror destinations
//! - [`NoteHistory`] - immutable per-note version snapshots
//! - [`UserShare`] - read-only capability grants
//!
//! ## Serialization
//!
//! Every persisted type implements `Serialize`/`Deserialize` from `serde`.
//! Durations that come from human-authored configuration (debounce delays,
//! retry backoff) serialize as milliseconds for cross-platform stability;
//! see [`deserialize_duration`]/[`serialize_duration`].
//!
//! ## Stability
//!
//! These types are considered stable unless otherwise noted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

pub use notesync_duration::{deserialize_duration, serialize_duration};

/// Compute the path-hash digest used to key resources within a vault.
///
/// The hash is a lowercase 32-character hex MD5 digest of the forward-slash
/// path. It is not a security boundary — it only needs to be stable and
/// collision-resistant enough to dedupe resources within one owner's vault.
pub fn path_hash(path: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(path.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A vault identifier. Vaults, notes, files, folders, configs, and history
/// rows all use plain integer ids, matching the relational store this crate
/// stands in front of.
pub type Id = i64;

/// A named workspace belonging to a user, containing notes, files, and
/// folders. Aggregate counts/sizes are maintained by the owning repository
/// as resources are created, updated, and deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vault {
    pub id: Id,
    pub owner: Id,
    pub name: String,
    pub note_count: i64,
    pub note_size: i64,
    pub file_count: i64,
    pub file_size: i64,
}

/// The action a resource row represents since it was last synced.
///
/// `Delete` rows are tombstones: they remain visible to incremental
/// iteration until a retention pass physically purges them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Create,
    Modify,
    Delete,
}

/// A text resource in a vault.
///
/// `(path_hash, vault_id, owner)` is unique among non-deleted notes. `path`
/// is always forward-slash and, for notes, always ends in `.md` by the time
/// it reaches the iterator (see [`crate::path_hash`] and the resource
/// iterator's normalization step).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub id: Id,
    pub vault_id: Id,
    pub owner: Id,
    pub path: String,
    pub path_hash: String,
    pub content: String,
    pub content_hash: String,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub action: ResourceAction,
    pub rename_flag: bool,
    /// Monotonic per-note version, advanced once per history-pipeline pass.
    pub version: i64,
    /// The content as of the last history snapshot (used to diff against on
    /// the next write).
    pub last_snapshot: String,
    pub last_snapshot_hash: String,
    /// Server-assigned update timestamp. Used by incremental iteration
    /// (`updated_at > since`).
    pub updated_at: DateTime<Utc>,
    pub client_name: String,
}

/// A binary attachment. Mirrors [`Note`] except content lives at an on-disk
/// path (`save_path`) with an explicit `size`, rather than inline text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct File {
    pub id: Id,
    pub vault_id: Id,
    pub owner: Id,
    pub path: String,
    pub path_hash: String,
    pub save_path: String,
    pub size: i64,
    pub content_hash: String,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub action: ResourceAction,
    pub rename_flag: bool,
    pub updated_at: DateTime<Utc>,
}

/// A materialized directory entity linking resources to a parent via `fid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: Id,
    pub vault_id: Id,
    pub owner: Id,
    pub fid: Id,
    pub path: String,
    pub action: ResourceAction,
    pub updated_at: DateTime<Utc>,
}

/// Export mode for a [`BackupConfig`].
///
/// `Sync` configs are trigger-driven (debounced change notifications), not
/// time-driven: their `next_run_time` is parked at a sentinel far future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
    Sync,
}

/// How a [`BackupConfig`]'s `cron_expression` is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronStrategy {
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl CronStrategy {
    /// Map a strategy to its 5-field cron expression. `Custom` has no fixed
    /// mapping — callers keep the user-supplied expression as-is.
    pub fn fixed_expression(self) -> Option<&'static str> {
        match self {
            CronStrategy::Daily => Some("0 0 * * *"),
            CronStrategy::Weekly => Some("0 0 * * 0"),
            CronStrategy::Monthly => Some("0 0 1 * *"),
            CronStrategy::Custom => None,
        }
    }
}

/// Retention policy for a [`BackupConfig`]'s history rows.
///
/// `-1` keeps only the current run's row; `0` disables cleanup entirely;
/// `N > 0` keeps `N` days of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionDays(pub i64);

impl RetentionDays {
    pub const KEEP_ONLY_CURRENT: RetentionDays = RetentionDays(-1);
    pub const NEVER: RetentionDays = RetentionDays(0);

    pub fn is_keep_only_current(self) -> bool {
        self.0 == -1
    }

    pub fn is_never(self) -> bool {
        self.0 == 0
    }
}

/// Terminal and in-flight states for a backup/mirror run.
///
/// Numeric discriminants match the externally persisted status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum BackupStatus {
    Running = 1,
    Success = 2,
    Failed = 3,
    Stopped = 4,
    NoUpdate = 5,
}

/// Terminal and in-flight states for a git-mirror run. Parallels
/// [`BackupStatus`] with an additional `Idle` state for a config that has
/// never run or has been reset by cleanup-workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitSyncStatus {
    Idle,
    Running,
    Success,
    Failed,
    Stopped,
}

/// A user-declared export intent: what to back up, where to send it, and on
/// what schedule.
///
/// `vault_id = 0` means "all vaults owned by `owner`". `storage_ids` is an
/// ordered list — destinations are attempted in list order, and one
/// destination failing does not stop the others.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupConfig {
    pub id: Id,
    pub owner: Id,
    pub vault_id: Id,
    pub backup_type: BackupType,
    pub storage_ids: Vec<Id>,
    pub cron_strategy: CronStrategy,
    /// Only set (and only consulted) when `cron_strategy == Custom`.
    pub cron_expression: Option<String>,
    pub retention_days: RetentionDays,
    pub is_enabled: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: DateTime<Utc>,
    pub last_status: Option<BackupStatus>,
    pub last_message: String,
}

/// A sentinel `next_run_time` for `type = sync` configs, parked far enough
/// in the future that the tick loop never fires it on a schedule.
pub fn sync_next_run_sentinel() -> DateTime<Utc> {
    "9999-01-01T00:00:00Z".parse().expect("valid sentinel timestamp")
}

/// One record per attempted destination per run. Append-only from the
/// orchestrator; purged only by retention cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupHistory {
    pub id: Id,
    pub owner: Id,
    pub config_id: Id,
    pub storage_id: Id,
    pub backup_type: BackupType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BackupStatus,
    pub file_count: i64,
    pub file_size: i64,
    pub message: String,
    /// Archive name when applicable (empty for mirror-mode rows).
    pub file_path: String,
}

/// A git-mirror destination configuration. Parallels [`BackupConfig`] with
/// repository-specific fields instead of a storage-id list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitSyncConfig {
    pub id: Id,
    pub owner: Id,
    pub vault_id: Id,
    pub repo_url: String,
    /// Encrypted at rest (see `notesync_encrypt`); never logged.
    pub credentials: String,
    pub branch: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub debounce_delay: Duration,
    pub is_enabled: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_status: GitSyncStatus,
    pub last_message: String,
}

/// One record per git-mirror run. Not written on a no-changes outcome (see
/// [`GitSyncConfig`] status-preservation behavior).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitSyncHistory {
    pub id: Id,
    pub owner: Id,
    pub config_id: Id,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: GitSyncStatus,
    pub file_count: i64,
    pub message: String,
}

/// An immutable version snapshot produced by the history pipeline.
///
/// Invariant: for a given `(note_id, version)`, applying `patch` to `base`
/// reconstructs the content that was current after that edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteHistory {
    pub id: Id,
    pub note_id: Id,
    pub vault_id: Id,
    /// The note's path at the time of this change, not necessarily its
    /// current path (renames preserve history across note ids).
    pub path: String,
    pub diff_patch: String,
    pub base_content: String,
    pub content_hash: String,
    pub client_name: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Which resource ids a [`UserShare`] grants read access to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareResources {
    #[serde(default)]
    pub note: Vec<Id>,
    #[serde(default)]
    pub file: Vec<Id>,
}

/// Whether a [`UserShare`] can still be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ShareStatus {
    Active = 1,
    Cancelled = 2,
}

/// A read-only capability grant over a set of notes/files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserShare {
    pub id: Id,
    pub owner: Id,
    pub resources: ShareResources,
    pub status: ShareStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub view_count: i64,
    pub last_viewed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hash_is_32_char_hex_and_stable() {
        let a = path_hash("notes/todo.md");
        let b = path_hash("notes/todo.md");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn path_hash_differs_for_different_paths() {
        assert_ne!(path_hash("a.md"), path_hash("b.md"));
    }

    #[test]
    fn cron_strategy_fixed_expressions_match_spec() {
        assert_eq!(CronStrategy::Daily.fixed_expression(), Some("0 0 * * *"));
        assert_eq!(CronStrategy::Weekly.fixed_expression(), Some("0 0 * * 0"));
        assert_eq!(CronStrategy::Monthly.fixed_expression(), Some("0 0 1 * *"));
        assert_eq!(CronStrategy::Custom.fixed_expression(), None);
    }

    #[test]
    fn retention_days_helpers() {
        assert!(RetentionDays::KEEP_ONLY_CURRENT.is_keep_only_current());
        assert!(RetentionDays::NEVER.is_never());
        assert!(!RetentionDays(30).is_keep_only_current());
        assert!(!RetentionDays(30).is_never());
    }

    #[test]
    fn backup_status_serializes_as_snake_case_variant() {
        let json = serde_json::to_string(&BackupStatus::NoUpdate).expect("serialize");
        assert_eq!(json, "\"no_update\"");
    }

    #[test]
    fn git_sync_config_roundtrips_json() {
        let cfg = GitSyncConfig {
            id: 1,
            owner: 1,
            vault_id: 1,
            repo_url: "git@example.com:vault.git".to_string(),
            credentials: "encrypted-blob".to_string(),
            branch: "main".to_string(),
            debounce_delay: Duration::from_secs(30),
            is_enabled: true,
            last_sync_time: None,
            last_status: GitSyncStatus::Idle,
            last_message: String::new(),
        };

        let json = serde_json::to_string(&cfg).expect("serialize");
        let parsed: GitSyncConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.debounce_delay, Duration::from_secs(30));
        assert_eq!(parsed.branch, "main");
    }

    #[test]
    fn sync_config_next_run_time_is_year_9999() {
        assert_eq!(sync_next_run_sentinel().format("%Y").to_string(), "9999");
    }

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn path_hash_always_32_hex_chars(path in "[a-zA-Z0-9/_.-]{1,200}") {
                let h = path_hash(&path);
                prop_assert_eq!(h.len(), 32);
                prop_assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
            }

            #[test]
            fn duration_ms_roundtrip(ms in 0u64..10_000_000) {
                let d = Duration::from_millis(ms);
                let json = serde_json::json!(d.as_millis() as u64);
                let deserialized: Duration = deserialize_duration(json).unwrap();
                prop_assert_eq!(deserialized, d);
            }
        }
    }
}
