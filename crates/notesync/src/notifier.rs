//! Change notifier (C7): turns note/file edits into the debounced triggers
//! [`crate::engine`] and [`crate::git`] consume.
//!
//! Two independent timer maps, both guarded by a mutex and both using the
//! same "replace on re-notification" rule: a new edit to the same key
//! cancels whatever timer was pending and arms a fresh one, so a burst of
//! edits collapses into a single fire after the quiet period (spec.md
//! §4.7). The owner map feeds C5 with a fixed 30-second delay; on fire it
//! just flips `pending[owner]` and lets the next scheduler tick pick it up.
//! The config map feeds C6 with each config's own configurable delay; on
//! fire it runs the sync directly, since C6 has no polling tick to defer to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notesync_types::Id;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::Engine;
use crate::error::{NoteSyncError, Result};
use crate::git::GitEngine;
use crate::repo::GitSyncRepo;

const OWNER_DEBOUNCE: Duration = Duration::from_secs(30);

/// Debounce timer maps plus the two engines they ultimately notify.
pub struct Notifier {
    engine: Arc<Engine>,
    git: Arc<GitEngine>,
    git_repo: Arc<dyn GitSyncRepo>,
    owner_timers: Mutex<HashMap<Id, CancellationToken>>,
    config_timers: Mutex<HashMap<Id, CancellationToken>>,
}

impl Notifier {
    pub fn new(engine: Arc<Engine>, git: Arc<GitEngine>, git_repo: Arc<dyn GitSyncRepo>) -> Self {
        Self {
            engine,
            git,
            git_repo,
            owner_timers: Mutex::new(HashMap::new()),
            config_timers: Mutex::new(HashMap::new()),
        }
    }

    /// Called on any note/file edit. Re-arms the owner's fixed C5 timer and
    /// every enabled git-sync config's own C6 timer for `vault_id`.
    pub async fn notify_edit(self: &Arc<Self>, tracker: &TaskTracker, lifecycle: &CancellationToken, owner: Id, vault_id: Id) -> Result<()> {
        self.arm_owner_timer(tracker, lifecycle, owner);

        let configs = self.git_repo.list_configs_for_vault(vault_id, owner).await.map_err(NoteSyncError::Local)?;
        for config in configs {
            if !config.is_enabled || config.debounce_delay.is_zero() {
                continue;
            }
            self.arm_config_timer(tracker, lifecycle, config.id, owner, config.debounce_delay);
        }
        Ok(())
    }

    fn arm_owner_timer(self: &Arc<Self>, tracker: &TaskTracker, lifecycle: &CancellationToken, owner: Id) {
        let token = replace_timer(&self.owner_timers, owner, lifecycle);
        let notifier = Arc::clone(self);
        tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(OWNER_DEBOUNCE) => {
                    notifier.engine.mark_pending(owner);
                    notifier.owner_timers.lock().expect("owner timer map lock poisoned").remove(&owner);
                }
            }
        });
    }

    fn arm_config_timer(self: &Arc<Self>, tracker: &TaskTracker, lifecycle: &CancellationToken, config_id: Id, owner: Id, delay: Duration) {
        let token = replace_timer(&self.config_timers, config_id, lifecycle);
        let notifier = Arc::clone(self);
        let git = Arc::clone(&self.git);
        let tracker_clone = tracker.clone();
        let fire_lifecycle = lifecycle.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    notifier.config_timers.lock().expect("config timer map lock poisoned").remove(&config_id);
                    // Reload rather than carry the config through the timer: it may
                    // have been edited (branch, delay, credentials) since the timer
                    // was armed, and a stale copy would sync against the wrong state.
                    match notifier.git_repo.get_by_id(config_id, owner).await {
                        Ok(Some(config)) => git.trigger(&tracker_clone, &fire_lifecycle, config),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(error = %e, config_id, "failed to reload git-sync config for debounced trigger"),
                    }
                }
            }
        });
    }

    /// Stops every pending timer without firing it (spec.md §4.10 shutdown
    /// step 2: "stop all pending debounce timers; clear timer maps").
    pub fn stop_all(&self) {
        for (_, token) in self.owner_timers.lock().expect("owner timer map lock poisoned").drain() {
            token.cancel();
        }
        for (_, token) in self.config_timers.lock().expect("config timer map lock poisoned").drain() {
            token.cancel();
        }
    }
}

/// Cancels whatever token was previously stored for `key` (if any) and
/// installs a fresh child of `lifecycle` in its place, returning it.
fn replace_timer(map: &Mutex<HashMap<Id, CancellationToken>>, key: Id, lifecycle: &CancellationToken) -> CancellationToken {
    let mut guard = map.lock().expect("timer map lock poisoned");
    if let Some(old) = guard.remove(&key) {
        old.cancel();
    }
    let token = lifecycle.child_token();
    guard.insert(key, token.clone());
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryRepo;
    use notesync_types::{BackupConfig, BackupType, CronStrategy, GitSyncConfig, GitSyncStatus, RetentionDays};

    fn git_config(owner: Id, vault: Id, delay: Duration) -> GitSyncConfig {
        GitSyncConfig {
            id: 0,
            owner,
            vault_id: vault,
            repo_url: "file:///tmp/repo".to_string(),
            credentials: String::new(),
            branch: "main".to_string(),
            debounce_delay: delay,
            is_enabled: true,
            last_sync_time: None,
            last_status: GitSyncStatus::Idle,
            last_message: String::new(),
        }
    }

    fn backup_config(owner: Id, vault: Id) -> BackupConfig {
        BackupConfig {
            id: 0,
            owner,
            vault_id: vault,
            backup_type: BackupType::Sync,
            storage_ids: vec![],
            cron_strategy: CronStrategy::Daily,
            cron_expression: None,
            retention_days: RetentionDays::NEVER,
            is_enabled: true,
            last_run_time: None,
            next_run_time: chrono::Utc::now(),
            last_status: None,
            last_message: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn owner_timer_fire_marks_pending() {
        let repo = Arc::new(InMemoryRepo::new());
        let workdir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::new(
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            Arc::new(crate::repo::DefaultDestinationFactory),
            workdir.path().to_path_buf(),
        ));
        crate::repo::BackupRepo::save_config(&*repo, backup_config(1, 1)).await.unwrap();

        let git_workdir = tempfile::tempdir().unwrap();
        let git = Arc::new(GitEngine::new(repo.clone(), repo.clone(), repo.clone(), git_workdir.path().to_path_buf()));
        let notifier = Arc::new(Notifier::new(engine.clone(), git, repo.clone()));

        let tracker = TaskTracker::new();
        let lifecycle = CancellationToken::new();
        notifier.notify_edit(&tracker, &lifecycle, 1, 1).await.unwrap();

        assert!(!engine.take_pending_for_test(1));
        tokio::time::advance(OWNER_DEBOUNCE + Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert!(engine.take_pending_for_test(1));
    }

    #[tokio::test]
    async fn renotification_replaces_owner_timer_without_double_firing() {
        let repo = Arc::new(InMemoryRepo::new());
        let workdir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::new(
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            Arc::new(crate::repo::DefaultDestinationFactory),
            workdir.path().to_path_buf(),
        ));
        let git_workdir = tempfile::tempdir().unwrap();
        let git = Arc::new(GitEngine::new(repo.clone(), repo.clone(), repo.clone(), git_workdir.path().to_path_buf()));
        let notifier = Arc::new(Notifier::new(engine, git, repo.clone()));

        let tracker = TaskTracker::new();
        let lifecycle = CancellationToken::new();
        notifier.notify_edit(&tracker, &lifecycle, 1, 1).await.unwrap();
        assert_eq!(notifier.owner_timers.lock().unwrap().len(), 1);
        notifier.notify_edit(&tracker, &lifecycle, 1, 1).await.unwrap();
        assert_eq!(notifier.owner_timers.lock().unwrap().len(), 1);
    }

    #[test]
    fn stop_all_clears_both_maps() {
        let owner_timers = Mutex::new(HashMap::from([(1, CancellationToken::new())]));
        let config_timers = Mutex::new(HashMap::from([(2, CancellationToken::new())]));
        for (_, t) in owner_timers.lock().unwrap().drain() {
            t.cancel();
        }
        for (_, t) in config_timers.lock().unwrap().drain() {
            t.cancel();
        }
        assert!(owner_timers.lock().unwrap().is_empty());
        assert!(config_timers.lock().unwrap().is_empty());
    }
}
