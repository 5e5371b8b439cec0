//! Resource iterator (C1): uniform traversal of a vault's notes and files,
//! full or since a timestamp, yielding one record per resource with
//! deletion markers so the archive and mirror paths can use the same
//! traversal.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_types::{Id, ResourceAction};

use crate::error::{NoteSyncError, Result};
use crate::repo::{FileRepo, NoteRepo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Note,
    File,
}

/// One resource emitted by [`iterate`]. Notes carry their content inline;
/// files point at their on-disk blob instead.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub path: String,
    pub bytes: Option<Vec<u8>>,
    pub local_path: Option<PathBuf>,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub deleted: bool,
}

/// Receives each record [`iterate`] produces. A callback error aborts
/// iteration and propagates (spec.md §4.1).
#[async_trait]
pub trait ResourceSink: Send {
    async fn handle(&mut self, record: ResourceRecord) -> Result<()>;
}

/// Walks `vault`'s notes, then its files, invoking `sink` once per
/// resource. `incremental = false` lists everything (the unix epoch is
/// used as the lower bound); `incremental = true` lists only rows whose
/// `updated_at > since`.
pub async fn iterate(
    note_repo: &dyn NoteRepo,
    file_repo: &dyn FileRepo,
    owner: Id,
    vault: Id,
    incremental: bool,
    since: DateTime<Utc>,
    sink: &mut dyn ResourceSink,
) -> Result<()> {
    let lower_bound = if incremental { since } else { DateTime::<Utc>::UNIX_EPOCH };

    let notes = note_repo
        .list_by_updated_timestamp(lower_bound, vault, owner)
        .await
        .map_err(NoteSyncError::Local)?;
    for note in notes {
        let deleted = note.action == ResourceAction::Delete;
        sink.handle(ResourceRecord {
            kind: ResourceKind::Note,
            path: normalize_note_path(&note.path),
            bytes: if deleted { None } else { Some(note.content.clone().into_bytes()) },
            local_path: None,
            size: note.content.len() as u64,
            mtime: note.mtime,
            deleted,
        })
        .await?;
    }

    let files = file_repo
        .list_by_updated_timestamp(lower_bound, vault, owner)
        .await
        .map_err(NoteSyncError::Local)?;
    for file in files {
        let deleted = file.action == ResourceAction::Delete;
        let size = if deleted {
            0
        } else {
            tokio::fs::metadata(&file.save_path).await.map(|m| m.len()).unwrap_or(0)
        };
        sink.handle(ResourceRecord {
            kind: ResourceKind::File,
            path: file.path.clone(),
            bytes: None,
            local_path: Some(PathBuf::from(&file.save_path)),
            size,
            mtime: file.mtime,
            deleted,
        })
        .await?;
    }

    Ok(())
}

fn normalize_note_path(path: &str) -> String {
    if path.ends_with(".md") { path.to_string() } else { format!("{path}.md") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryRepo;
    use notesync_types::{File, Note};

    struct CollectingSink(Vec<ResourceRecord>);

    #[async_trait]
    impl ResourceSink for CollectingSink {
        async fn handle(&mut self, record: ResourceRecord) -> Result<()> {
            self.0.push(record);
            Ok(())
        }
    }

    fn note(owner: Id, vault: Id, path: &str, action: ResourceAction) -> Note {
        Note {
            id: 0,
            vault_id: vault,
            owner,
            path: path.to_string(),
            path_hash: notesync_types::path_hash(path),
            content: "content".to_string(),
            content_hash: "hash".to_string(),
            mtime: Utc::now(),
            ctime: Utc::now(),
            action,
            rename_flag: false,
            version: 1,
            last_snapshot: String::new(),
            last_snapshot_hash: String::new(),
            updated_at: Utc::now(),
            client_name: "test".to_string(),
        }
    }

    #[test]
    fn normalizes_missing_md_suffix() {
        assert_eq!(normalize_note_path("notes/a"), "notes/a.md");
        assert_eq!(normalize_note_path("notes/a.md"), "notes/a.md");
    }

    #[tokio::test]
    async fn full_iteration_visits_notes_before_files() {
        let repo = InMemoryRepo::new();
        NoteRepo::create(&repo, note(1, 1, "a", ResourceAction::Create)).await.unwrap();
        FileRepo::create(
            &repo,
            File {
                id: 0,
                vault_id: 1,
                owner: 1,
                path: "img.png".to_string(),
                path_hash: notesync_types::path_hash("img.png"),
                save_path: "/nonexistent/img.png".to_string(),
                size: 0,
                content_hash: "h".to_string(),
                mtime: Utc::now(),
                ctime: Utc::now(),
                action: ResourceAction::Create,
                rename_flag: false,
                updated_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let mut sink = CollectingSink(Vec::new());
        iterate(&repo, &repo, 1, 1, false, Utc::now(), &mut sink).await.unwrap();

        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[0].kind, ResourceKind::Note);
        assert_eq!(sink.0[0].path, "a.md");
        assert_eq!(sink.0[1].kind, ResourceKind::File);
        assert_eq!(sink.0[1].size, 0, "missing blob yields size 0 but still flows");
    }

    #[tokio::test]
    async fn incremental_mode_filters_by_timestamp() {
        let repo = InMemoryRepo::new();
        NoteRepo::create(&repo, note(1, 1, "a.md", ResourceAction::Create)).await.unwrap();

        let future_cutoff = Utc::now() + chrono::Duration::seconds(60);
        let mut sink = CollectingSink(Vec::new());
        iterate(&repo, &repo, 1, 1, true, future_cutoff, &mut sink).await.unwrap();
        assert!(sink.0.is_empty());
    }

    #[tokio::test]
    async fn deleted_note_still_flows_without_bytes() {
        let repo = InMemoryRepo::new();
        NoteRepo::create(&repo, note(1, 1, "a.md", ResourceAction::Delete)).await.unwrap();

        let mut sink = CollectingSink(Vec::new());
        iterate(&repo, &repo, 1, 1, false, Utc::now(), &mut sink).await.unwrap();

        assert_eq!(sink.0.len(), 1);
        assert!(sink.0[0].deleted);
        assert!(sink.0[0].bytes.is_none());
    }

    #[tokio::test]
    async fn callback_error_aborts_iteration() {
        struct FailingSink;
        #[async_trait]
        impl ResourceSink for FailingSink {
            async fn handle(&mut self, _record: ResourceRecord) -> Result<()> {
                Err(NoteSyncError::InvalidInput("boom".to_string()))
            }
        }

        let repo = InMemoryRepo::new();
        NoteRepo::create(&repo, note(1, 1, "a.md", ResourceAction::Create)).await.unwrap();

        let mut sink = FailingSink;
        let result = iterate(&repo, &repo, 1, 1, false, Utc::now(), &mut sink).await;
        assert!(result.is_err());
    }
}
