//! Backup orchestrator (C5): a per-config scheduler that decides when a
//! [`BackupConfig`] is due, enforces mutual exclusion via
//! [`crate::lock::ConcurrencyGuard`], dispatches to the archive or mirror
//! path, and runs the finalize/retention steps that close out every run.
//!
//! Vault selection is simplified to a single concrete `vault_id` per config:
//! the data model allows `vault_id = 0` to mean "all vaults owned by
//! `owner`", but [`VaultRepo`] has no method that enumerates a owner's
//! vaults, so that wildcard isn't resolvable against the collaborator
//! surface this crate is built against. See `DESIGN.md`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use notesync_storage::DestinationDriver;
use notesync_types::{BackupConfig, BackupHistory, BackupStatus, BackupType, Id};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::archive::{ArchiveOutcome, ArchiveWriter, archive_file_name, package_zip};
use crate::cron::next_run_time;
use crate::error::{NoteSyncError, Result};
use crate::iterator::{ResourceRecord, ResourceSink, iterate};
use crate::lock::{AcquirePolicy, ConcurrencyGuard};
use crate::repo::{BackupRepo, DestinationFactory, FileRepo, NoteRepo, StorageService, VaultRepo};

/// Wiring the tick loop needs. Constructed once and shared (via [`Arc`])
/// across the lifecycle that owns it.
pub struct Engine {
    backup_repo: Arc<dyn BackupRepo>,
    note_repo: Arc<dyn NoteRepo>,
    file_repo: Arc<dyn FileRepo>,
    vault_repo: Arc<dyn VaultRepo>,
    storage: Arc<dyn StorageService>,
    destinations: Arc<dyn DestinationFactory>,
    guard: ConcurrencyGuard,
    pending: Mutex<HashMap<Id, bool>>,
    workdir_root: PathBuf,
}

impl Engine {
    pub fn new(
        backup_repo: Arc<dyn BackupRepo>,
        note_repo: Arc<dyn NoteRepo>,
        file_repo: Arc<dyn FileRepo>,
        vault_repo: Arc<dyn VaultRepo>,
        storage: Arc<dyn StorageService>,
        destinations: Arc<dyn DestinationFactory>,
        workdir_root: PathBuf,
    ) -> Self {
        Self {
            backup_repo,
            note_repo,
            file_repo,
            vault_repo,
            storage,
            destinations,
            guard: ConcurrencyGuard::new(),
            pending: Mutex::new(HashMap::new()),
            workdir_root,
        }
    }

    /// Called by the change notifier (C7) on an owner's edit. Consumed by
    /// the next tick for that owner's sync/incremental configs.
    pub fn mark_pending(&self, owner: Id) {
        self.pending.lock().expect("pending map lock poisoned").insert(owner, true);
    }

    fn take_pending(&self, owner: Id) -> bool {
        self.pending.lock().expect("pending map lock poisoned").insert(owner, false) == Some(true)
    }

    #[cfg(test)]
    pub(crate) fn take_pending_for_test(&self, owner: Id) -> bool {
        self.take_pending(owner)
    }

    /// Runs the scheduler until `lifecycle` is cancelled. Each triggered
    /// config is spawned on `tracker` so the caller can await drain on
    /// shutdown (spec.md §4.10's wait-group).
    pub async fn run(self: Arc<Self>, tracker: TaskTracker, lifecycle: CancellationToken, tick_interval: std::time::Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                _ = lifecycle.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&tracker, &lifecycle).await {
                        tracing::warn!(error = %e, "backup scheduler tick failed");
                    }
                }
            }
        }
    }

    async fn tick(self: &Arc<Self>, tracker: &TaskTracker, lifecycle: &CancellationToken) -> Result<()> {
        let configs = self.backup_repo.list_enabled_configs().await.map_err(NoteSyncError::Local)?;
        let now = Utc::now();

        for config in configs {
            let pending_was_set = self.take_pending(config.owner);
            let due = now >= config.next_run_time;
            let triggered = due || (pending_was_set && config.backup_type == BackupType::Sync);
            if !triggered {
                continue;
            }

            let policy = match config.backup_type {
                BackupType::Sync => AcquirePolicy::ReplaceRunning,
                BackupType::Full | BackupType::Incremental => AcquirePolicy::RejectIfRunning,
            };

            self.spawn_run(tracker, lifecycle, config, policy, pending_was_set);
        }
        Ok(())
    }

    fn spawn_run(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        lifecycle: &CancellationToken,
        config: BackupConfig,
        policy: AcquirePolicy,
        pending_was_set: bool,
    ) {
        let engine = Arc::clone(self);
        let lifecycle = lifecycle.clone();
        tracker.spawn(async move {
            let Some(slot) = engine.guard.acquire(config.id, &lifecycle, policy) else {
                return;
            };
            engine.run_once(config, slot.token.clone(), pending_was_set).await;
        });
    }

    async fn run_once(&self, mut config: BackupConfig, token: CancellationToken, pending_was_set: bool) {
        let start = Utc::now();

        config.last_status = Some(BackupStatus::Running);
        if let Err(e) = self.backup_repo.save_config(config.clone()).await {
            tracing::warn!(error = %e, config_id = config.id, "failed to persist running status");
        }

        let should_run = match config.backup_type {
            BackupType::Full => true,
            BackupType::Incremental | BackupType::Sync => pending_was_set || config.last_run_time.is_none(),
        };

        let outcome = if !should_run {
            Ok(RunOutcome::NoUpdate)
        } else {
            self.dispatch(&config, start, &token).await
        };

        let lifecycle_cancelled = token.is_cancelled();
        if let Err(e) = self.finalize(config, start, outcome, lifecycle_cancelled).await {
            tracing::warn!(error = %e, "failed to finalize backup run");
        }
    }

    async fn dispatch(&self, config: &BackupConfig, start: DateTime<Utc>, token: &CancellationToken) -> Result<RunOutcome> {
        match config.backup_type {
            BackupType::Full | BackupType::Incremental => self.run_archive(config, start, token).await,
            BackupType::Sync => self.run_mirror(config, token).await,
        }
    }

    async fn run_archive(&self, config: &BackupConfig, start: DateTime<Utc>, token: &CancellationToken) -> Result<RunOutcome> {
        let vault = self
            .vault_repo
            .get_by_id(config.vault_id, config.owner)
            .await
            .map_err(NoteSyncError::Local)?
            .ok_or(NoteSyncError::VaultNotFound { owner: config.owner, vault: config.vault_id.to_string() })?;

        let incremental = config.backup_type == BackupType::Incremental;
        let since = config.last_run_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let workdir = self.workdir_root.join(format!("run-{}-{}", config.id, start.timestamp_millis()));
        tokio::fs::create_dir_all(&workdir).await.map_err(|e| NoteSyncError::Local(e.into()))?;
        let mut writer = ArchiveWriter::new(workdir.clone());
        let iter_result = iterate(self.note_repo.as_ref(), self.file_repo.as_ref(), config.owner, config.vault_id, incremental, since, &mut writer).await;
        if let Err(e) = iter_result {
            let _ = tokio::fs::remove_dir_all(&workdir).await;
            return Err(e);
        }

        if writer.file_count() == 0 {
            let _ = tokio::fs::remove_dir_all(&workdir).await;
            return Ok(RunOutcome::NoUpdate);
        }

        let zip_name = archive_file_name(config.backup_type, config.owner, &vault.name, start);
        let zip_path = self.workdir_root.join(&zip_name);
        let outcome = package_zip(&workdir, &zip_path, writer.file_count(), writer.total_size());
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        let ArchiveOutcome::Created { file_count, total_size } = outcome? else {
            return Ok(RunOutcome::NoUpdate);
        };

        let mut any_success = false;
        let mut failures = Vec::new();
        for &storage_id in &config.storage_ids {
            if token.is_cancelled() {
                let _ = tokio::fs::remove_file(&zip_path).await;
                return Ok(RunOutcome::Stopped);
            }
            let Some(dest_config) = self.storage.get(config.owner, storage_id).await.map_err(NoteSyncError::Local)? else {
                continue;
            };
            if !dest_config.is_enabled {
                continue;
            }

            let mut history = self
                .backup_repo
                .create_history(BackupHistory {
                    id: 0,
                    owner: config.owner,
                    config_id: config.id,
                    storage_id,
                    backup_type: config.backup_type,
                    start_time: start,
                    end_time: None,
                    status: BackupStatus::Running,
                    file_count: file_count as i64,
                    file_size: total_size as i64,
                    message: String::new(),
                    file_path: zip_name.clone(),
                })
                .await
                .map_err(NoteSyncError::Local)?;

            let result = self.send_archive(&dest_config, &zip_path, &zip_name, start).await;
            history.end_time = Some(Utc::now());
            match result {
                Ok(()) => {
                    history.status = BackupStatus::Success;
                    any_success = true;
                }
                Err(e) => {
                    history.status = BackupStatus::Failed;
                    history.message = e.to_string();
                    failures.push(e.to_string());
                }
            }
            self.backup_repo.update_history(history).await.map_err(NoteSyncError::Local)?;
        }
        let _ = tokio::fs::remove_file(&zip_path).await;
        let _ = any_success;

        combine_destination_results(failures)
    }

    async fn send_archive(&self, dest_config: &notesync_storage::DestinationConfig, zip_path: &PathBuf, zip_name: &str, mtime: DateTime<Utc>) -> Result<()> {
        let driver = self.destinations.new_destination(dest_config).map_err(NoteSyncError::Local)?;
        let mut file = tokio::fs::File::open(zip_path).await.map_err(|e| NoteSyncError::Local(e.into()))?;
        driver.send_stream(zip_name, &mut file, "application/zip", mtime).await.map_err(NoteSyncError::Local)?;
        Ok(())
    }

    async fn run_mirror(&self, config: &BackupConfig, token: &CancellationToken) -> Result<RunOutcome> {
        let mut probe = CountingSink::default();
        iterate(self.note_repo.as_ref(), self.file_repo.as_ref(), config.owner, config.vault_id, true, config.last_run_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH), &mut probe).await?;
        if probe.count == 0 {
            return Ok(RunOutcome::NoUpdate);
        }

        let mut failures = Vec::new();
        for &storage_id in &config.storage_ids {
            if token.is_cancelled() {
                return Ok(RunOutcome::Stopped);
            }
            let Some(dest_config) = self.storage.get(config.owner, storage_id).await.map_err(NoteSyncError::Local)? else {
                continue;
            };
            if !dest_config.is_enabled {
                continue;
            }

            let mut history = self
                .backup_repo
                .create_history(BackupHistory {
                    id: 0,
                    owner: config.owner,
                    config_id: config.id,
                    storage_id,
                    backup_type: BackupType::Sync,
                    start_time: Utc::now(),
                    end_time: None,
                    status: BackupStatus::Running,
                    file_count: probe.count as i64,
                    file_size: 0,
                    message: String::new(),
                    file_path: String::new(),
                })
                .await
                .map_err(NoteSyncError::Local)?;

            let driver = self.destinations.new_destination(&dest_config).map_err(NoteSyncError::Local)?;
            let mut sink = MirrorSink { driver: driver.as_ref() };
            let result = iterate(
                self.note_repo.as_ref(),
                self.file_repo.as_ref(),
                config.owner,
                config.vault_id,
                true,
                config.last_run_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                &mut sink,
            )
            .await;

            history.end_time = Some(Utc::now());
            match result {
                Ok(()) => history.status = BackupStatus::Success,
                Err(e) => {
                    history.status = BackupStatus::Failed;
                    history.message = e.to_string();
                    failures.push(e.to_string());
                }
            }
            self.backup_repo.update_history(history).await.map_err(NoteSyncError::Local)?;
        }

        combine_destination_results(failures)
    }

    async fn finalize(&self, mut config: BackupConfig, start: DateTime<Utc>, outcome: Result<RunOutcome>, lifecycle_cancelled: bool) -> Result<()> {
        config.last_run_time = Some(start);
        let (status, message) = match &outcome {
            _ if lifecycle_cancelled => (BackupStatus::Stopped, String::new()),
            Ok(RunOutcome::Success) => (BackupStatus::Success, String::new()),
            Ok(RunOutcome::NoUpdate) => (BackupStatus::NoUpdate, String::new()),
            Ok(RunOutcome::Stopped) => (BackupStatus::Stopped, String::new()),
            Err(e) => (BackupStatus::Failed, e.to_string()),
        };
        config.last_status = Some(status);
        config.last_message = message;
        config.next_run_time = next_run_time(&config, start)?;
        self.backup_repo.save_config(config.clone()).await.map_err(NoteSyncError::Local)?;

        if status != BackupStatus::Stopped {
            self.apply_retention(&config, start).await?;
        }
        Ok(())
    }

    async fn apply_retention(&self, config: &BackupConfig, start: DateTime<Utc>) -> Result<()> {
        if config.retention_days.is_never() {
            return Ok(());
        }
        let cutoff = if config.retention_days.is_keep_only_current() {
            start
        } else {
            Utc::now() - ChronoDuration::days(config.retention_days.0)
        };

        let old = self.backup_repo.list_old_history(cutoff, config.id).await.map_err(NoteSyncError::Local)?;
        for row in &old {
            if row.backup_type != BackupType::Sync && !row.file_path.is_empty() {
                match self.storage.get(config.owner, row.storage_id).await {
                    Ok(Some(dest_config)) => match self.destinations.new_destination(&dest_config) {
                        Ok(driver) => {
                            if let Err(e) = driver.delete(&row.file_path).await {
                                tracing::warn!(error = %e, file_path = %row.file_path, "retention cleanup failed to delete artifact");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "retention cleanup failed to build destination"),
                    },
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "retention cleanup failed to resolve destination"),
                }
            }
        }
        self.backup_repo.delete_old_history(cutoff, config.id).await.map_err(NoteSyncError::Local)?;
        Ok(())
    }
}

fn combine_destination_results(failures: Vec<String>) -> Result<RunOutcome> {
    if failures.is_empty() {
        Ok(RunOutcome::Success)
    } else {
        let last = failures.last().cloned().unwrap_or_default();
        Err(NoteSyncError::Local(anyhow::anyhow!("{} destination(s) failed, last error: {last}", failures.len())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Success,
    NoUpdate,
    Stopped,
}

#[derive(Default)]
struct CountingSink {
    count: u64,
}

#[async_trait]
impl ResourceSink for CountingSink {
    async fn handle(&mut self, _record: ResourceRecord) -> Result<()> {
        self.count += 1;
        Ok(())
    }
}

struct MirrorSink<'a> {
    driver: &'a dyn DestinationDriver,
}

#[async_trait]
impl ResourceSink for MirrorSink<'_> {
    async fn handle(&mut self, record: ResourceRecord) -> Result<()> {
        if record.deleted {
            return self.driver.delete(&record.path).await.map_err(NoteSyncError::Local);
        }
        if let Some(bytes) = &record.bytes {
            self.driver.send_bytes(&record.path, bytes, record.mtime).await.map_err(NoteSyncError::Local)?;
        } else if let Some(path) = &record.local_path {
            let mut file = tokio::fs::File::open(path).await.map_err(|e| NoteSyncError::Local(e.into()))?;
            self.driver.send_stream(&record.path, &mut file, "application/octet-stream", record.mtime).await.map_err(NoteSyncError::Local)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryRepo;
    use notesync_storage::DestinationConfig;
    use notesync_types::{CronStrategy, Note, ResourceAction, RetentionDays, Vault};

    fn engine_with(repo: Arc<InMemoryRepo>, workdir: PathBuf) -> Arc<Engine> {
        Arc::new(Engine::new(
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            Arc::new(crate::repo::DefaultDestinationFactory),
            workdir,
        ))
    }

    fn config(owner: Id, vault_id: Id, backup_type: BackupType, storage_id: Id) -> BackupConfig {
        BackupConfig {
            id: 0,
            owner,
            vault_id,
            backup_type,
            storage_ids: vec![storage_id],
            cron_strategy: CronStrategy::Daily,
            cron_expression: None,
            retention_days: RetentionDays::NEVER,
            is_enabled: true,
            last_run_time: None,
            next_run_time: Utc::now(),
            last_status: None,
            last_message: String::new(),
        }
    }

    fn note(owner: Id, vault: Id, path: &str) -> Note {
        Note {
            id: 0,
            vault_id: vault,
            owner,
            path: path.to_string(),
            path_hash: notesync_types::path_hash(path),
            content: "hello".to_string(),
            content_hash: "h".to_string(),
            mtime: Utc::now(),
            ctime: Utc::now(),
            action: ResourceAction::Create,
            rename_flag: false,
            version: 0,
            last_snapshot: String::new(),
            last_snapshot_hash: String::new(),
            updated_at: Utc::now(),
            client_name: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn full_backup_writes_archive_to_local_destination() {
        let repo = Arc::new(InMemoryRepo::new());
        repo.insert_vault(Vault { id: 1, owner: 1, name: "vault".into(), note_count: 0, note_size: 0, file_count: 0, file_size: 0 });
        NoteRepo::create(&*repo, note(1, 1, "a.md")).await.unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        repo.insert_destination(9, DestinationConfig::local(dest_dir.path().to_string_lossy().to_string()));

        let workdir = tempfile::tempdir().unwrap();
        let engine = engine_with(repo.clone(), workdir.path().to_path_buf());

        let saved = BackupRepo::save_config(&*repo, config(1, 1, BackupType::Full, 9)).await.unwrap();
        let token = CancellationToken::new();
        engine.run_once(saved.clone(), token, false).await;

        let updated = BackupRepo::get_by_id(&*repo, saved.id, 1).await.unwrap().unwrap();
        assert_eq!(updated.last_status, Some(BackupStatus::Success));

        let history = BackupRepo::list_history(&*repo, saved.id, 1, 0, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BackupStatus::Success);

        let mut entries = std::fs::read_dir(dest_dir.path()).unwrap();
        assert!(entries.next().is_some(), "archive should have landed in the destination");
    }

    #[tokio::test]
    async fn empty_vault_full_backup_is_no_update() {
        let repo = Arc::new(InMemoryRepo::new());
        repo.insert_vault(Vault { id: 1, owner: 1, name: "vault".into(), note_count: 0, note_size: 0, file_count: 0, file_size: 0 });

        let workdir = tempfile::tempdir().unwrap();
        let engine = engine_with(repo.clone(), workdir.path().to_path_buf());
        let saved = BackupRepo::save_config(&*repo, config(1, 1, BackupType::Full, 9)).await.unwrap();

        engine.run_once(saved.clone(), CancellationToken::new(), false).await;

        let updated = BackupRepo::get_by_id(&*repo, saved.id, 1).await.unwrap().unwrap();
        assert_eq!(updated.last_status, Some(BackupStatus::NoUpdate));
    }

    #[tokio::test]
    async fn incremental_without_pending_and_prior_run_is_no_update() {
        let repo = Arc::new(InMemoryRepo::new());
        repo.insert_vault(Vault { id: 1, owner: 1, name: "vault".into(), note_count: 0, note_size: 0, file_count: 0, file_size: 0 });
        NoteRepo::create(&*repo, note(1, 1, "a.md")).await.unwrap();

        let workdir = tempfile::tempdir().unwrap();
        let engine = engine_with(repo.clone(), workdir.path().to_path_buf());
        let mut cfg = config(1, 1, BackupType::Incremental, 9);
        cfg.last_run_time = Some(Utc::now() - ChronoDuration::hours(1));
        let saved = BackupRepo::save_config(&*repo, cfg).await.unwrap();

        engine.run_once(saved.clone(), CancellationToken::new(), false).await;

        let updated = BackupRepo::get_by_id(&*repo, saved.id, 1).await.unwrap().unwrap();
        assert_eq!(updated.last_status, Some(BackupStatus::NoUpdate));
    }

    #[tokio::test]
    async fn retention_keep_only_current_deletes_older_rows() {
        let repo = Arc::new(InMemoryRepo::new());
        let mut cfg = config(1, 1, BackupType::Full, 9);
        cfg.retention_days = RetentionDays::KEEP_ONLY_CURRENT;
        let saved = BackupRepo::save_config(&*repo, cfg).await.unwrap();

        BackupRepo::create_history(
            &*repo,
            BackupHistory {
                id: 0,
                owner: 1,
                config_id: saved.id,
                storage_id: 9,
                backup_type: BackupType::Full,
                start_time: Utc::now() - ChronoDuration::days(1),
                end_time: None,
                status: BackupStatus::Success,
                file_count: 1,
                file_size: 1,
                message: String::new(),
                file_path: String::new(),
            },
        )
        .await
        .unwrap();

        let workdir = tempfile::tempdir().unwrap();
        let engine = engine_with(repo.clone(), workdir.path().to_path_buf());
        engine.apply_retention(&saved, Utc::now()).await.unwrap();

        let remaining = BackupRepo::list_history(&*repo, saved.id, 1, 0, 10).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn sync_replace_cancels_prior_run_slot() {
        let repo = Arc::new(InMemoryRepo::new());
        let workdir = tempfile::tempdir().unwrap();
        let engine = engine_with(repo, workdir.path().to_path_buf());

        let parent = CancellationToken::new();
        let first = engine.guard.acquire(1, &parent, AcquirePolicy::ReplaceRunning).unwrap();
        let first_token = first.token.clone();
        let _second = engine.guard.acquire(1, &parent, AcquirePolicy::ReplaceRunning).unwrap();
        assert!(first_token.is_cancelled());
    }
}
