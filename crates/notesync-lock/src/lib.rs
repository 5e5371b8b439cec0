//! File-based locking for a git-mirror workspace directory.
//!
//! Each git-sync config owns a workspace directory
//! (`<root>/<owner>/<config-id>`); the lock file inside it prevents two
//! orchestrator tasks from cloning/pulling/pushing the same workspace
//! concurrently. The lock is JSON metadata about the holder (PID, hostname,
//! timestamp, an optional label such as the config id), written atomically
//! via a tmp-file rename.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Hostname where the lock was acquired.
    pub hostname: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Caller-supplied label for the held lock (e.g. a git-sync config id).
    pub label: Option<String>,
}

/// Lock file handle that automatically releases on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire a lock in `workspace_dir`.
    ///
    /// Fails if a lock already exists and is not stale. Use [`Self::is_locked`]
    /// first to check, or [`Self::acquire_with_timeout`] for automatic stale
    /// lock handling.
    pub fn acquire(workspace_dir: &Path) -> Result<Self> {
        let lock_path = workspace_dir.join(LOCK_FILE);

        fs::create_dir_all(workspace_dir).with_context(|| {
            format!("failed to create workspace dir {}", workspace_dir.display())
        })?;

        if lock_path.exists() {
            let existing_info = Self::read_lock_info(workspace_dir)?;
            bail!(
                "lock already held by pid {} on {} since {} (label: {:?})",
                existing_info.pid,
                existing_info.hostname,
                existing_info.acquired_at,
                existing_info.label
            );
        }

        let pid = std::process::id();
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let info = LockInfo {
            pid,
            hostname,
            acquired_at: Utc::now(),
            label: None,
        };

        write_lock_info(&lock_path, &info)?;

        Ok(Self { path: lock_path })
    }

    /// Acquire a lock, automatically removing stale locks older than `timeout`.
    pub fn acquire_with_timeout(workspace_dir: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = workspace_dir.join(LOCK_FILE);

        if lock_path.exists() {
            if let Ok(info) = Self::read_lock_info(workspace_dir) {
                let age = Utc::now() - info.acquired_at;
                if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove stale lock file {}", lock_path.display())
                    })?;
                } else {
                    bail!(
                        "lock already held by pid {} on {} since {} (age: {:?})",
                        info.pid,
                        info.hostname,
                        info.acquired_at,
                        age
                    );
                }
            } else {
                fs::remove_file(&lock_path).with_context(|| {
                    format!("failed to remove corrupt lock file {}", lock_path.display())
                })?;
            }
        }

        Self::acquire(workspace_dir)
    }

    /// Release the lock file. Safe to call more than once.
    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Update the label stored in the lock file.
    pub fn set_label(&self, label: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("lock file does not exist at {}", self.path.display());
        }

        let mut info = read_lock_info_from_path(&self.path)?;
        info.label = Some(label.to_string());
        write_lock_info(&self.path, &info)
    }

    /// Check whether a lock file exists in `workspace_dir`.
    pub fn is_locked(workspace_dir: &Path) -> Result<bool> {
        Ok(workspace_dir.join(LOCK_FILE).exists())
    }

    /// Read the lock file information for `workspace_dir`.
    pub fn read_lock_info(workspace_dir: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&workspace_dir.join(LOCK_FILE))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info(path: &Path, info: &LockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create lock tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename lock file to {}", path.display()))
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

/// The lock file path for a workspace directory.
pub fn lock_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(LOCK_FILE)
}
