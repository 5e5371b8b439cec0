//! Repository and collaborator interfaces the engine is built against (§6),
//! plus in-memory implementations used by tests and small deployments.
//!
//! These are deliberately thin async traits: the relational store, its
//! migrations, and tenancy enforcement live outside this crate. Every
//! method here still takes an explicit `owner` so a real implementation can
//! enforce it; [`InMemoryRepo`] enforces it too, so tests exercise the same
//! cross-owner rejection a real store would.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_storage::{DestinationConfig, DestinationDriver, build_destination};
use notesync_types::{
    BackupConfig, BackupHistory, File, Folder, GitSyncConfig, GitSyncHistory, Id, Note, NoteHistory, UserShare, Vault,
};

#[async_trait]
pub trait VaultRepo: Send + Sync {
    async fn get_by_name(&self, owner: Id, name: &str) -> Result<Option<Vault>>;
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<Vault>>;
    async fn update_note_count_size(&self, vault_id: Id, owner: Id, note_count: i64, note_size: i64) -> Result<()>;
    async fn update_file_count_size(&self, vault_id: Id, owner: Id, file_count: i64, file_size: i64) -> Result<()>;
}

#[async_trait]
pub trait NoteRepo: Send + Sync {
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<Note>>;
    async fn create(&self, note: Note) -> Result<Note>;
    async fn update(&self, note: Note) -> Result<()>;
    async fn update_mtime(&self, id: Id, owner: Id, mtime: DateTime<Utc>) -> Result<()>;
    async fn update_delete(&self, id: Id, owner: Id) -> Result<()>;
    async fn update_snapshot(&self, id: Id, owner: Id, content: String, hash: String, version: i64) -> Result<()>;
    /// `since` is the exclusive lower bound; a full listing passes the unix
    /// epoch so incremental and full modes share one method (spec.md §4.1).
    async fn list_by_updated_timestamp(&self, since: DateTime<Utc>, vault: Id, owner: Id) -> Result<Vec<Note>>;
    async fn list_by_ids(&self, ids: &[Id], owner: Id) -> Result<Vec<Note>>;
    async fn delete_physical_by_time(&self, cutoff: DateTime<Utc>, owner: Id) -> Result<u64>;
    async fn delete_physical_by_time_all(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait FileRepo: Send + Sync {
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<File>>;
    async fn create(&self, file: File) -> Result<File>;
    async fn update(&self, file: File) -> Result<()>;
    async fn update_mtime(&self, id: Id, owner: Id, mtime: DateTime<Utc>) -> Result<()>;
    async fn update_delete(&self, id: Id, owner: Id) -> Result<()>;
    async fn list_by_updated_timestamp(&self, since: DateTime<Utc>, vault: Id, owner: Id) -> Result<Vec<File>>;
    async fn list_by_ids(&self, ids: &[Id], owner: Id) -> Result<Vec<File>>;
    async fn delete_physical_by_time(&self, cutoff: DateTime<Utc>, owner: Id) -> Result<u64>;
    async fn delete_physical_by_time_all(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait NoteHistoryRepo: Send + Sync {
    async fn create(&self, history: NoteHistory) -> Result<NoteHistory>;
    async fn delete(&self, id: Id, owner: Id) -> Result<()>;
    async fn list_by_note_id(&self, note_id: Id, owner: Id) -> Result<Vec<NoteHistory>>;
    async fn get_latest_version(&self, note_id: Id, owner: Id) -> Result<Option<i64>>;
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<NoteHistory>>;
    async fn get_by_note_id_and_hash(&self, note_id: Id, hash: &str, owner: Id) -> Result<Option<NoteHistory>>;
    /// Reassigns every history row from `old` to `new` (rename preserves
    /// history, spec.md §4.4).
    async fn migrate(&self, old: Id, new: Id, owner: Id) -> Result<u64>;
    async fn delete_old_versions(&self, note_id: Id, cutoff: DateTime<Utc>, keep: u32, owner: Id) -> Result<u64>;
    async fn get_note_ids_with_old_history(&self, cutoff: DateTime<Utc>, owner: Id) -> Result<Vec<Id>>;
}

#[async_trait]
pub trait BackupRepo: Send + Sync {
    async fn list_enabled_configs(&self) -> Result<Vec<BackupConfig>>;
    async fn list_configs(&self, owner: Id) -> Result<Vec<BackupConfig>>;
    async fn save_config(&self, config: BackupConfig) -> Result<BackupConfig>;
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<BackupConfig>>;
    async fn delete_config(&self, id: Id, owner: Id) -> Result<()>;
    async fn create_history(&self, history: BackupHistory) -> Result<BackupHistory>;
    async fn update_history(&self, history: BackupHistory) -> Result<()>;
    async fn list_history(&self, config_id: Id, owner: Id, offset: u64, limit: u64) -> Result<Vec<BackupHistory>>;
    async fn list_old_history(&self, cutoff: DateTime<Utc>, config_id: Id) -> Result<Vec<BackupHistory>>;
    async fn delete_old_history(&self, cutoff: DateTime<Utc>, config_id: Id) -> Result<u64>;
}

#[async_trait]
pub trait GitSyncRepo: Send + Sync {
    async fn list_enabled_configs(&self) -> Result<Vec<GitSyncConfig>>;
    async fn list_configs_for_vault(&self, vault_id: Id, owner: Id) -> Result<Vec<GitSyncConfig>>;
    async fn save_config(&self, config: GitSyncConfig) -> Result<GitSyncConfig>;
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<GitSyncConfig>>;
    async fn delete_config(&self, id: Id, owner: Id) -> Result<()>;
    async fn create_history(&self, history: GitSyncHistory) -> Result<GitSyncHistory>;
    async fn update_history(&self, history: GitSyncHistory) -> Result<()>;
    async fn delete_all_history(&self, config_id: Id, owner: Id) -> Result<u64>;
}

/// `StorageService.Get(owner, id) → DestinationConfig{...}` (§6).
#[async_trait]
pub trait StorageService: Send + Sync {
    async fn get(&self, owner: Id, id: Id) -> Result<Option<DestinationConfig>>;
}

/// `DestinationFactory.New(config) → {send_stream, send_bytes, delete}` (§6).
pub trait DestinationFactory: Send + Sync {
    fn new_destination(&self, config: &DestinationConfig) -> Result<Box<dyn DestinationDriver>>;
}

/// The default factory: delegates straight to [`notesync_storage::build_destination`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDestinationFactory;

impl DestinationFactory for DefaultDestinationFactory {
    fn new_destination(&self, config: &DestinationConfig) -> Result<Box<dyn DestinationDriver>> {
        build_destination(config)
    }
}

#[async_trait]
pub trait ShareRepo: Send + Sync {
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<UserShare>>;
    async fn update_view_stats(&self, owner: Id, id: Id, count_delta: u64, last_viewed_at: DateTime<Utc>) -> Result<()>;
}

/// In-memory implementation of every repository trait above, for tests and
/// small single-process deployments. Tenancy is enforced the same way a
/// real store would: a row whose `owner` doesn't match the caller is
/// treated as absent.
#[derive(Default)]
pub struct InMemoryRepo {
    vaults: Mutex<HashMap<Id, Vault>>,
    notes: Mutex<HashMap<Id, Note>>,
    files: Mutex<HashMap<Id, File>>,
    folders: Mutex<HashMap<Id, Folder>>,
    note_history: Mutex<HashMap<Id, NoteHistory>>,
    backup_configs: Mutex<HashMap<Id, BackupConfig>>,
    backup_history: Mutex<HashMap<Id, BackupHistory>>,
    git_configs: Mutex<HashMap<Id, GitSyncConfig>>,
    git_history: Mutex<HashMap<Id, GitSyncHistory>>,
    destinations: Mutex<HashMap<Id, DestinationConfig>>,
    shares: Mutex<HashMap<Id, UserShare>>,
    next_id: Mutex<Id>,
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            ..Default::default()
        }
    }

    fn alloc_id(&self) -> Id {
        let mut next = self.next_id.lock().expect("id counter lock poisoned");
        let id = *next;
        *next += 1;
        id
    }

    pub fn insert_vault(&self, mut vault: Vault) -> Vault {
        if vault.id == 0 {
            vault.id = self.alloc_id();
        }
        self.vaults.lock().expect("lock poisoned").insert(vault.id, vault.clone());
        vault
    }

    pub fn insert_destination(&self, id: Id, config: DestinationConfig) {
        self.destinations.lock().expect("lock poisoned").insert(id, config);
    }

    pub fn insert_share(&self, share: UserShare) {
        self.shares.lock().expect("lock poisoned").insert(share.id, share);
    }

    /// Test-only: counts `GitSyncHistory` rows for a config (the trait has
    /// no listing method — history rows are only ever read back by id in
    /// production, via a paged API outside this crate's surface).
    pub fn git_history_count(&self, config_id: Id) -> usize {
        self.git_history.lock().expect("lock poisoned").values().filter(|h| h.config_id == config_id).count()
    }
}

#[async_trait]
impl VaultRepo for InMemoryRepo {
    async fn get_by_name(&self, owner: Id, name: &str) -> Result<Option<Vault>> {
        Ok(self
            .vaults
            .lock()
            .expect("lock poisoned")
            .values()
            .find(|v| v.owner == owner && v.name == name)
            .cloned())
    }

    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<Vault>> {
        Ok(self
            .vaults
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .filter(|v| v.owner == owner)
            .cloned())
    }

    async fn update_note_count_size(&self, vault_id: Id, owner: Id, note_count: i64, note_size: i64) -> Result<()> {
        if let Some(v) = self.vaults.lock().expect("lock poisoned").get_mut(&vault_id)
            && v.owner == owner
        {
            v.note_count = note_count;
            v.note_size = note_size;
        }
        Ok(())
    }

    async fn update_file_count_size(&self, vault_id: Id, owner: Id, file_count: i64, file_size: i64) -> Result<()> {
        if let Some(v) = self.vaults.lock().expect("lock poisoned").get_mut(&vault_id)
            && v.owner == owner
        {
            v.file_count = file_count;
            v.file_size = file_size;
        }
        Ok(())
    }
}

#[async_trait]
impl NoteRepo for InMemoryRepo {
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<Note>> {
        Ok(self.notes.lock().expect("lock poisoned").get(&id).filter(|n| n.owner == owner).cloned())
    }

    async fn create(&self, mut note: Note) -> Result<Note> {
        if note.id == 0 {
            note.id = self.alloc_id();
        }
        self.notes.lock().expect("lock poisoned").insert(note.id, note.clone());
        Ok(note)
    }

    async fn update(&self, note: Note) -> Result<()> {
        self.notes.lock().expect("lock poisoned").insert(note.id, note);
        Ok(())
    }

    async fn update_mtime(&self, id: Id, owner: Id, mtime: DateTime<Utc>) -> Result<()> {
        if let Some(n) = self.notes.lock().expect("lock poisoned").get_mut(&id)
            && n.owner == owner
        {
            n.mtime = mtime;
            n.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_delete(&self, id: Id, owner: Id) -> Result<()> {
        if let Some(n) = self.notes.lock().expect("lock poisoned").get_mut(&id)
            && n.owner == owner
        {
            n.action = notesync_types::ResourceAction::Delete;
            n.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_snapshot(&self, id: Id, owner: Id, content: String, hash: String, version: i64) -> Result<()> {
        if let Some(n) = self.notes.lock().expect("lock poisoned").get_mut(&id)
            && n.owner == owner
        {
            n.last_snapshot = content;
            n.last_snapshot_hash = hash;
            n.version = version;
        }
        Ok(())
    }

    async fn list_by_updated_timestamp(&self, since: DateTime<Utc>, vault: Id, owner: Id) -> Result<Vec<Note>> {
        let mut notes: Vec<Note> = self
            .notes
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|n| n.owner == owner && n.vault_id == vault && n.updated_at > since)
            .cloned()
            .collect();
        notes.sort_by_key(|n| n.id);
        Ok(notes)
    }

    async fn list_by_ids(&self, ids: &[Id], owner: Id) -> Result<Vec<Note>> {
        let notes = self.notes.lock().expect("lock poisoned");
        Ok(ids.iter().filter_map(|id| notes.get(id).filter(|n| n.owner == owner).cloned()).collect())
    }

    async fn delete_physical_by_time(&self, cutoff: DateTime<Utc>, owner: Id) -> Result<u64> {
        let mut notes = self.notes.lock().expect("lock poisoned");
        let before = notes.len();
        notes.retain(|_, n| {
            !(n.owner == owner && n.action == notesync_types::ResourceAction::Delete && n.updated_at < cutoff)
        });
        Ok((before - notes.len()) as u64)
    }

    async fn delete_physical_by_time_all(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut notes = self.notes.lock().expect("lock poisoned");
        let before = notes.len();
        notes.retain(|_, n| !(n.action == notesync_types::ResourceAction::Delete && n.updated_at < cutoff));
        Ok((before - notes.len()) as u64)
    }
}

#[async_trait]
impl FileRepo for InMemoryRepo {
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<File>> {
        Ok(self.files.lock().expect("lock poisoned").get(&id).filter(|f| f.owner == owner).cloned())
    }

    async fn create(&self, mut file: File) -> Result<File> {
        if file.id == 0 {
            file.id = self.alloc_id();
        }
        self.files.lock().expect("lock poisoned").insert(file.id, file.clone());
        Ok(file)
    }

    async fn update(&self, file: File) -> Result<()> {
        self.files.lock().expect("lock poisoned").insert(file.id, file);
        Ok(())
    }

    async fn update_mtime(&self, id: Id, owner: Id, mtime: DateTime<Utc>) -> Result<()> {
        if let Some(f) = self.files.lock().expect("lock poisoned").get_mut(&id)
            && f.owner == owner
        {
            f.mtime = mtime;
            f.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_delete(&self, id: Id, owner: Id) -> Result<()> {
        if let Some(f) = self.files.lock().expect("lock poisoned").get_mut(&id)
            && f.owner == owner
        {
            f.action = notesync_types::ResourceAction::Delete;
            f.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_by_updated_timestamp(&self, since: DateTime<Utc>, vault: Id, owner: Id) -> Result<Vec<File>> {
        let mut files: Vec<File> = self
            .files
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|f| f.owner == owner && f.vault_id == vault && f.updated_at > since)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.id);
        Ok(files)
    }

    async fn list_by_ids(&self, ids: &[Id], owner: Id) -> Result<Vec<File>> {
        let files = self.files.lock().expect("lock poisoned");
        Ok(ids.iter().filter_map(|id| files.get(id).filter(|f| f.owner == owner).cloned()).collect())
    }

    async fn delete_physical_by_time(&self, cutoff: DateTime<Utc>, owner: Id) -> Result<u64> {
        let mut files = self.files.lock().expect("lock poisoned");
        let before = files.len();
        files.retain(|_, f| {
            !(f.owner == owner && f.action == notesync_types::ResourceAction::Delete && f.updated_at < cutoff)
        });
        Ok((before - files.len()) as u64)
    }

    async fn delete_physical_by_time_all(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut files = self.files.lock().expect("lock poisoned");
        let before = files.len();
        files.retain(|_, f| !(f.action == notesync_types::ResourceAction::Delete && f.updated_at < cutoff));
        Ok((before - files.len()) as u64)
    }
}

#[async_trait]
impl NoteHistoryRepo for InMemoryRepo {
    async fn create(&self, mut history: NoteHistory) -> Result<NoteHistory> {
        if history.id == 0 {
            history.id = self.alloc_id();
        }
        self.note_history.lock().expect("lock poisoned").insert(history.id, history.clone());
        Ok(history)
    }

    async fn delete(&self, id: Id, owner: Id) -> Result<()> {
        let mut history = self.note_history.lock().expect("lock poisoned");
        let note_id = history.get(&id).map(|h| h.note_id);
        if let Some(note_id) = note_id {
            let owner_matches = self.notes.lock().expect("lock poisoned").get(&note_id).is_some_and(|n| n.owner == owner);
            if owner_matches {
                history.remove(&id);
            }
        }
        Ok(())
    }

    async fn list_by_note_id(&self, note_id: Id, owner: Id) -> Result<Vec<NoteHistory>> {
        if !self.notes.lock().expect("lock poisoned").get(&note_id).is_some_and(|n| n.owner == owner) {
            return Ok(Vec::new());
        }
        let mut rows: Vec<NoteHistory> = self
            .note_history
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|h| h.note_id == note_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.version);
        Ok(rows)
    }

    async fn get_latest_version(&self, note_id: Id, owner: Id) -> Result<Option<i64>> {
        Ok(self.list_by_note_id(note_id, owner).await?.into_iter().map(|h| h.version).max())
    }

    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<NoteHistory>> {
        let history = self.note_history.lock().expect("lock poisoned").get(&id).cloned();
        match history {
            Some(h) if self.notes.lock().expect("lock poisoned").get(&h.note_id).is_some_and(|n| n.owner == owner) => Ok(Some(h)),
            _ => Ok(None),
        }
    }

    async fn get_by_note_id_and_hash(&self, note_id: Id, hash: &str, owner: Id) -> Result<Option<NoteHistory>> {
        Ok(self
            .list_by_note_id(note_id, owner)
            .await?
            .into_iter()
            .find(|h| h.content_hash == hash))
    }

    async fn migrate(&self, old: Id, new: Id, owner: Id) -> Result<u64> {
        let owner_ok = self.notes.lock().expect("lock poisoned").get(&old).is_some_and(|n| n.owner == owner)
            || self.notes.lock().expect("lock poisoned").get(&new).is_some_and(|n| n.owner == owner);
        if !owner_ok {
            return Ok(0);
        }
        let mut history = self.note_history.lock().expect("lock poisoned");
        let mut moved = 0u64;
        for h in history.values_mut() {
            if h.note_id == old {
                h.note_id = new;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn delete_old_versions(&self, note_id: Id, cutoff: DateTime<Utc>, keep: u32, owner: Id) -> Result<u64> {
        let mut rows = self.list_by_note_id(note_id, owner).await?;
        rows.sort_by_key(|h| h.version);
        let keep = keep as usize;
        if rows.len() <= keep {
            return Ok(0);
        }
        let deletable = &rows[..rows.len() - keep];
        let mut history = self.note_history.lock().expect("lock poisoned");
        let mut deleted = 0u64;
        for row in deletable {
            if row.created_at < cutoff {
                history.remove(&row.id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn get_note_ids_with_old_history(&self, cutoff: DateTime<Utc>, owner: Id) -> Result<Vec<Id>> {
        let notes = self.notes.lock().expect("lock poisoned");
        let mut ids: Vec<Id> = self
            .note_history
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|h| h.created_at < cutoff)
            .filter(|h| notes.get(&h.note_id).is_some_and(|n| n.owner == owner))
            .map(|h| h.note_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

#[async_trait]
impl BackupRepo for InMemoryRepo {
    async fn list_enabled_configs(&self) -> Result<Vec<BackupConfig>> {
        Ok(self.backup_configs.lock().expect("lock poisoned").values().filter(|c| c.is_enabled).cloned().collect())
    }

    async fn list_configs(&self, owner: Id) -> Result<Vec<BackupConfig>> {
        Ok(self.backup_configs.lock().expect("lock poisoned").values().filter(|c| c.owner == owner).cloned().collect())
    }

    async fn save_config(&self, mut config: BackupConfig) -> Result<BackupConfig> {
        if config.id == 0 {
            config.id = self.alloc_id();
        }
        self.backup_configs.lock().expect("lock poisoned").insert(config.id, config.clone());
        Ok(config)
    }

    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<BackupConfig>> {
        Ok(self.backup_configs.lock().expect("lock poisoned").get(&id).filter(|c| c.owner == owner).cloned())
    }

    async fn delete_config(&self, id: Id, owner: Id) -> Result<()> {
        let mut configs = self.backup_configs.lock().expect("lock poisoned");
        if configs.get(&id).is_some_and(|c| c.owner == owner) {
            configs.remove(&id);
        }
        Ok(())
    }

    async fn create_history(&self, mut history: BackupHistory) -> Result<BackupHistory> {
        if history.id == 0 {
            history.id = self.alloc_id();
        }
        self.backup_history.lock().expect("lock poisoned").insert(history.id, history.clone());
        Ok(history)
    }

    async fn update_history(&self, history: BackupHistory) -> Result<()> {
        self.backup_history.lock().expect("lock poisoned").insert(history.id, history);
        Ok(())
    }

    async fn list_history(&self, config_id: Id, owner: Id, offset: u64, limit: u64) -> Result<Vec<BackupHistory>> {
        let mut rows: Vec<BackupHistory> = self
            .backup_history
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|h| h.config_id == config_id && h.owner == owner)
            .cloned()
            .collect();
        rows.sort_by_key(|h| std::cmp::Reverse(h.start_time));
        Ok(rows.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn list_old_history(&self, cutoff: DateTime<Utc>, config_id: Id) -> Result<Vec<BackupHistory>> {
        Ok(self
            .backup_history
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|h| h.config_id == config_id && h.start_time < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_old_history(&self, cutoff: DateTime<Utc>, config_id: Id) -> Result<u64> {
        let mut history = self.backup_history.lock().expect("lock poisoned");
        let before = history.len();
        history.retain(|_, h| !(h.config_id == config_id && h.start_time < cutoff));
        Ok((before - history.len()) as u64)
    }
}

#[async_trait]
impl GitSyncRepo for InMemoryRepo {
    async fn list_enabled_configs(&self) -> Result<Vec<GitSyncConfig>> {
        Ok(self.git_configs.lock().expect("lock poisoned").values().filter(|c| c.is_enabled).cloned().collect())
    }

    async fn list_configs_for_vault(&self, vault_id: Id, owner: Id) -> Result<Vec<GitSyncConfig>> {
        Ok(self
            .git_configs
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|c| c.vault_id == vault_id && c.owner == owner)
            .cloned()
            .collect())
    }

    async fn save_config(&self, mut config: GitSyncConfig) -> Result<GitSyncConfig> {
        if config.id == 0 {
            config.id = self.alloc_id();
        }
        self.git_configs.lock().expect("lock poisoned").insert(config.id, config.clone());
        Ok(config)
    }

    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<GitSyncConfig>> {
        Ok(self.git_configs.lock().expect("lock poisoned").get(&id).filter(|c| c.owner == owner).cloned())
    }

    async fn delete_config(&self, id: Id, owner: Id) -> Result<()> {
        let mut configs = self.git_configs.lock().expect("lock poisoned");
        if configs.get(&id).is_some_and(|c| c.owner == owner) {
            configs.remove(&id);
        }
        Ok(())
    }

    async fn create_history(&self, mut history: GitSyncHistory) -> Result<GitSyncHistory> {
        if history.id == 0 {
            history.id = self.alloc_id();
        }
        self.git_history.lock().expect("lock poisoned").insert(history.id, history.clone());
        Ok(history)
    }

    async fn update_history(&self, history: GitSyncHistory) -> Result<()> {
        self.git_history.lock().expect("lock poisoned").insert(history.id, history);
        Ok(())
    }

    async fn delete_all_history(&self, config_id: Id, owner: Id) -> Result<u64> {
        let mut history = self.git_history.lock().expect("lock poisoned");
        let before = history.len();
        history.retain(|_, h| !(h.config_id == config_id && h.owner == owner));
        Ok((before - history.len()) as u64)
    }
}

#[async_trait]
impl StorageService for InMemoryRepo {
    async fn get(&self, _owner: Id, id: Id) -> Result<Option<DestinationConfig>> {
        Ok(self.destinations.lock().expect("lock poisoned").get(&id).cloned())
    }
}

#[async_trait]
impl ShareRepo for InMemoryRepo {
    async fn get_by_id(&self, id: Id, owner: Id) -> Result<Option<UserShare>> {
        Ok(self.shares.lock().expect("lock poisoned").get(&id).filter(|s| s.owner == owner).cloned())
    }

    async fn update_view_stats(&self, owner: Id, id: Id, count_delta: u64, last_viewed_at: DateTime<Utc>) -> Result<()> {
        if let Some(s) = self.shares.lock().expect("lock poisoned").get_mut(&id)
            && s.owner == owner
        {
            s.view_count += count_delta;
            s.last_viewed_at = Some(last_viewed_at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_types::{BackupType, CronStrategy, RetentionDays, ResourceAction};

    fn sample_note(owner: Id, vault_id: Id) -> Note {
        Note {
            id: 0,
            vault_id,
            owner,
            path: "a.md".to_string(),
            path_hash: notesync_types::path_hash("a.md"),
            content: "hello".to_string(),
            content_hash: "h1".to_string(),
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
    async fn vault_repo_enforces_tenancy() {
        let repo = InMemoryRepo::new();
        let vault = repo.insert_vault(Vault { id: 0, owner: 1, name: "v".into(), note_count: 0, note_size: 0, file_count: 0, file_size: 0 });
        assert!(VaultRepo::get_by_id(&repo, vault.id, 1).await.unwrap().is_some());
        assert!(VaultRepo::get_by_id(&repo, vault.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn note_repo_create_and_list_by_timestamp() {
        let repo = InMemoryRepo::new();
        let note = NoteRepo::create(&repo, sample_note(1, 1)).await.unwrap();
        assert_ne!(note.id, 0);

        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let listed = NoteRepo::list_by_updated_timestamp(&repo, epoch, 1, 1).await.unwrap();
        assert_eq!(listed.len(), 1);

        let listed_other_owner = NoteRepo::list_by_updated_timestamp(&repo, epoch, 1, 2).await.unwrap();
        assert!(listed_other_owner.is_empty());
    }

    #[tokio::test]
    async fn note_history_migrate_reassigns_rows() {
        let repo = InMemoryRepo::new();
        let old_note = NoteRepo::create(&repo, sample_note(1, 1)).await.unwrap();
        let new_note = NoteRepo::create(&repo, sample_note(1, 1)).await.unwrap();

        NoteHistoryRepo::create(
            &repo,
            NoteHistory {
                id: 0,
                note_id: old_note.id,
                vault_id: 1,
                path: "a.md".into(),
                diff_patch: "patch".into(),
                base_content: "base".into(),
                content_hash: "h".into(),
                client_name: "test".into(),
                version: 1,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let moved = NoteHistoryRepo::migrate(&repo, old_note.id, new_note.id, 1).await.unwrap();
        assert_eq!(moved, 1);

        let rows = NoteHistoryRepo::list_by_note_id(&repo, new_note.id, 1).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn backup_repo_round_trip() {
        let repo = InMemoryRepo::new();
        let config = BackupRepo::save_config(
            &repo,
            BackupConfig {
                id: 0,
                owner: 1,
                vault_id: 1,
                backup_type: BackupType::Full,
                storage_ids: vec![1],
                cron_strategy: CronStrategy::Daily,
                cron_expression: None,
                retention_days: RetentionDays(0),
                is_enabled: true,
                last_run_time: None,
                next_run_time: Utc::now(),
                last_status: None,
                last_message: String::new(),
            },
        )
        .await
        .unwrap();

        let enabled = BackupRepo::list_enabled_configs(&repo).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, config.id);
    }

    #[test]
    fn default_destination_factory_builds_local() {
        let factory = DefaultDestinationFactory;
        let td = tempfile::tempdir().unwrap();
        let config = DestinationConfig::local(td.path().to_string_lossy().to_string());
        assert!(factory.new_destination(&config).is_ok());
    }
}
