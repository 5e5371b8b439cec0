//! History pipeline (C4): a bounded queue feeding a single consumer that
//! versions every note write into a [`NoteHistory`] row, with retention.
//!
//! The diff-patch format is line-based: each entry in the (JSON-encoded)
//! patch names a line as kept, inserted, or deleted relative to the base.
//! Because kept/inserted lines carry their own text, a patch alone
//! reconstructs the post-edit content — the spec's round-trip invariant
//! (applying row k's patch yields the content current as of row k) holds
//! without re-parsing the stored base.

use std::sync::Arc;

use notesync_types::{Id, Note, NoteHistory};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NoteSyncError, Result};
use crate::repo::{NoteHistoryRepo, NoteRepo};

pub const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub enum HistoryMessage {
    /// Posted on every note write (create, modify, restore, delete).
    Versioned { note_id: Id, owner: Id },
    /// Posted on rename: reassigns history from `old_note_id` to `new_note_id`.
    Migrate { old_note_id: Id, new_note_id: Id, owner: Id },
}

/// Producer handle. Cloned freely; the channel is the only shared state.
#[derive(Clone)]
pub struct HistoryPipeline {
    sender: mpsc::Sender<HistoryMessage>,
}

impl HistoryPipeline {
    /// Builds a pipeline and its worker. The channel has capacity
    /// [`CHANNEL_CAPACITY`]; producers block when it's full rather than
    /// drop messages (spec.md §5, "Backpressure").
    pub fn new(
        note_repo: Arc<dyn NoteRepo>,
        history_repo: Arc<dyn NoteHistoryRepo>,
        keep_versions: u32,
    ) -> (Self, HistoryWorker) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { sender }, HistoryWorker { receiver, note_repo, history_repo, keep_versions })
    }

    pub async fn enqueue_versioned(&self, note_id: Id, owner: Id) -> Result<()> {
        self.sender
            .send(HistoryMessage::Versioned { note_id, owner })
            .await
            .map_err(|_| NoteSyncError::Local(anyhow::anyhow!("history pipeline worker has stopped")))
    }

    pub async fn enqueue_migrate(&self, old_note_id: Id, new_note_id: Id, owner: Id) -> Result<()> {
        self.sender
            .send(HistoryMessage::Migrate { old_note_id, new_note_id, owner })
            .await
            .map_err(|_| NoteSyncError::Local(anyhow::anyhow!("history pipeline worker has stopped")))
    }
}

/// The single consumer. Messages for the same note-id are never reordered
/// because they share one channel and one worker loop.
pub struct HistoryWorker {
    receiver: mpsc::Receiver<HistoryMessage>,
    note_repo: Arc<dyn NoteRepo>,
    history_repo: Arc<dyn NoteHistoryRepo>,
    keep_versions: u32,
}

impl HistoryWorker {
    /// Runs until the channel closes or `cancel` fires. A processing error
    /// for one message is logged and does not stop the worker — later
    /// messages for other notes must still be processed.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                message = self.receiver.recv() => {
                    let Some(message) = message else { return };
                    if let Err(e) = self.process(message).await {
                        tracing::warn!(error = %e, "history pipeline message failed");
                    }
                }
            }
        }
    }

    async fn process(&self, message: HistoryMessage) -> Result<()> {
        match message {
            HistoryMessage::Versioned { note_id, owner } => self.process_versioned(note_id, owner).await,
            HistoryMessage::Migrate { old_note_id, new_note_id, owner } => {
                self.process_migrate(old_note_id, new_note_id, owner).await
            }
        }
    }

    async fn process_versioned(&self, note_id: Id, owner: Id) -> Result<()> {
        let Some(note) = self.note_repo.get_by_id(note_id, owner).await.map_err(NoteSyncError::Local)? else {
            return Ok(());
        };
        if note.content == note.last_snapshot {
            return Ok(());
        }

        let patch = compute_patch(&note.last_snapshot, &note.content)?;
        let highest = self
            .history_repo
            .get_latest_version(note_id, owner)
            .await
            .map_err(NoteSyncError::Local)?
            .unwrap_or(0);
        let new_version = highest + 1;

        self.history_repo
            .create(NoteHistory {
                id: 0,
                note_id,
                vault_id: note.vault_id,
                path: note.path.clone(),
                diff_patch: patch,
                base_content: note.last_snapshot.clone(),
                content_hash: note.last_snapshot_hash.clone(),
                client_name: note.client_name.clone(),
                version: new_version,
                created_at: note.updated_at,
            })
            .await
            .map_err(NoteSyncError::Local)?;

        self.note_repo
            .update_snapshot(note_id, owner, note.content.clone(), note.content_hash.clone(), new_version)
            .await
            .map_err(NoteSyncError::Local)?;

        self.enforce_keep_versions(note_id, owner).await
    }

    async fn enforce_keep_versions(&self, note_id: Id, owner: Id) -> Result<()> {
        let mut rows = self.history_repo.list_by_note_id(note_id, owner).await.map_err(NoteSyncError::Local)?;
        if rows.len() as u32 <= self.keep_versions {
            return Ok(());
        }
        rows.sort_by_key(|r| r.version);
        let oldest = &rows[0];
        self.history_repo.delete(oldest.id, owner).await.map_err(NoteSyncError::Local)
    }

    async fn process_migrate(&self, old_note_id: Id, new_note_id: Id, owner: Id) -> Result<()> {
        self.history_repo.migrate(old_note_id, new_note_id, owner).await.map_err(NoteSyncError::Local)?;

        if let Some(old_note) = self.note_repo.get_by_id(old_note_id, owner).await.map_err(NoteSyncError::Local)?
            && let Some(new_note) = self.note_repo.get_by_id(new_note_id, owner).await.map_err(NoteSyncError::Local)?
        {
            self.note_repo
                .update_snapshot(
                    new_note_id,
                    owner,
                    old_note.last_snapshot.clone(),
                    old_note.last_snapshot_hash.clone(),
                    old_note.version,
                )
                .await
                .map_err(NoteSyncError::Local)?;

            let mut deleted_old = old_note;
            deleted_old.action = notesync_types::ResourceAction::Delete;
            deleted_old.rename_flag = true;
            self.note_repo.update(deleted_old).await.map_err(NoteSyncError::Local)?;
            let _ = new_note;
        }
        Ok(())
    }
}

/// Periodic cutoff-based cleanup across every note with old history (not
/// per-write, unlike [`HistoryWorker`]): deletes rows older than `cutoff`
/// while retaining the most recent `keep` rows regardless of age.
pub async fn cleanup_by_time(history_repo: &dyn NoteHistoryRepo, cutoff: chrono::DateTime<chrono::Utc>, keep: u32, owner: Id) -> Result<u64> {
    let note_ids = history_repo.get_note_ids_with_old_history(cutoff, owner).await.map_err(NoteSyncError::Local)?;
    let mut deleted = 0u64;
    for note_id in note_ids {
        deleted += history_repo.delete_old_versions(note_id, cutoff, keep, owner).await.map_err(NoteSyncError::Local)?;
    }
    Ok(deleted)
}

/// Applies a stored patch to reconstruct the content it was computed
/// against (restore-from-history, §4.4/§6): the result is written back via
/// the normal note write path by the caller, which re-enters the pipeline.
pub fn apply_patch(history: &NoteHistory) -> Result<String> {
    let ops: Vec<PatchOp> = serde_json::from_str(&history.diff_patch).map_err(|e| NoteSyncError::Local(e.into()))?;
    let mut content = String::new();
    for op in ops {
        match op {
            PatchOp::Equal(line) | PatchOp::Insert(line) => content.push_str(&line),
            PatchOp::Delete(_) => {}
        }
    }
    Ok(content)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PatchOp {
    Equal(String),
    Insert(String),
    Delete(String),
}

fn compute_patch(base: &str, content: &str) -> Result<String> {
    let diff = TextDiff::from_lines(base, content);
    let ops: Vec<PatchOp> = diff
        .iter_all_changes()
        .map(|change| {
            let line = change.value().to_string();
            match change.tag() {
                ChangeTag::Equal => PatchOp::Equal(line),
                ChangeTag::Insert => PatchOp::Insert(line),
                ChangeTag::Delete => PatchOp::Delete(line),
            }
        })
        .collect();
    serde_json::to_string(&ops).map_err(|e| NoteSyncError::Local(e.into()))
}

#[allow(dead_code)]
fn unused_note_field_hint(_note: &Note) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryRepo;
    use chrono::Utc;
    use notesync_types::ResourceAction;

    fn note(owner: Id, content: &str, last_snapshot: &str) -> Note {
        Note {
            id: 0,
            vault_id: 1,
            owner,
            path: "a.md".to_string(),
            path_hash: notesync_types::path_hash("a.md"),
            content: content.to_string(),
            content_hash: format!("hash:{content}"),
            mtime: Utc::now(),
            ctime: Utc::now(),
            action: ResourceAction::Modify,
            rename_flag: false,
            version: 0,
            last_snapshot: last_snapshot.to_string(),
            last_snapshot_hash: format!("hash:{last_snapshot}"),
            updated_at: Utc::now(),
            client_name: "client-a".to_string(),
        }
    }

    #[test]
    fn patch_round_trips_exactly() {
        let base = "line one\nline two\n";
        let content = "line one\nline three\nline four\n";
        let patch = compute_patch(base, content).unwrap();

        let history = NoteHistory {
            id: 1,
            note_id: 1,
            vault_id: 1,
            path: "a.md".into(),
            diff_patch: patch,
            base_content: base.to_string(),
            content_hash: "irrelevant".into(),
            client_name: "c".into(),
            version: 1,
            created_at: Utc::now(),
        };
        assert_eq!(apply_patch(&history).unwrap(), content);
    }

    #[tokio::test]
    async fn versioned_message_writes_history_and_updates_snapshot() {
        let repo = Arc::new(InMemoryRepo::new());
        let created = NoteRepo::create(&*repo, note(1, "v2", "v1")).await.unwrap();

        let (pipeline, worker) = HistoryPipeline::new(repo.clone(), repo.clone(), 10);
        pipeline.enqueue_versioned(created.id, 1).await.unwrap();
        drop(pipeline);
        worker.run(CancellationToken::new()).await;

        let rows = NoteHistoryRepo::list_by_note_id(&*repo, created.id, 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 1);
        assert_eq!(rows[0].base_content, "v1");

        let updated = NoteRepo::get_by_id(&*repo, created.id, 1).await.unwrap().unwrap();
        assert_eq!(updated.last_snapshot, "v2");
        assert_eq!(updated.version, 1);
    }

    #[tokio::test]
    async fn unchanged_content_produces_no_history_row() {
        let repo = Arc::new(InMemoryRepo::new());
        let created = NoteRepo::create(&*repo, note(1, "same", "same")).await.unwrap();

        let (pipeline, worker) = HistoryPipeline::new(repo.clone(), repo.clone(), 10);
        pipeline.enqueue_versioned(created.id, 1).await.unwrap();
        drop(pipeline);
        worker.run(CancellationToken::new()).await;

        let rows = NoteHistoryRepo::list_by_note_id(&*repo, created.id, 1).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn keep_versions_deletes_oldest_when_exceeded() {
        let repo = Arc::new(InMemoryRepo::new());
        let mut current = NoteRepo::create(&*repo, note(1, "v1", "")).await.unwrap();

        let (pipeline, worker) = HistoryPipeline::new(repo.clone(), repo.clone(), 2);
        let worker_handle = tokio::spawn(worker.run(CancellationToken::new()));

        for v in 2..=4 {
            current.last_snapshot = current.content.clone();
            current.content = format!("v{v}");
            NoteRepo::update(&*repo, current.clone()).await.unwrap();
            pipeline.enqueue_versioned(current.id, 1).await.unwrap();
        }
        drop(pipeline);
        worker_handle.await.unwrap();

        let rows = NoteHistoryRepo::list_by_note_id(&*repo, current.id, 1).await.unwrap();
        assert_eq!(rows.len(), 2, "retains at most `keep` most-recent rows");
        assert_eq!(rows.iter().map(|r| r.version).max().unwrap(), 3);
    }
}
