//! Conflict-copy writer (C8): when an upstream write can't be merged, this
//! records the client's version side-by-side instead of clobbering or
//! rejecting it (spec.md §4.8). The engine never attempts a merge itself —
//! merging is a user action performed later against the conflict copy.
//!
//! Conflict paths follow `<base>.conflict.<yyyyMMddHHmmss><ext>`, matching
//! `^(.+)\.conflict\.(\d{14})(\.[^.]+)?$` (spec.md §6) so that stripping
//! `.conflict.<ts>` always restores the original path exactly.

use chrono::{DateTime, Utc};
use notesync_types::{Id, Note, ResourceAction, path_hash};

use crate::error::Result;
use crate::repo::NoteRepo;

/// Splits `path` into `(base, ext)` where `ext` includes the leading dot, or
/// is empty if `path` has no extension. A leading-dot hidden file like
/// `.gitignore` is treated as having no extension, matching `Path::extension`.
fn split_base_ext(path: &str) -> (&str, &str) {
    let file_name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let file_name = &path[file_name_start..];
    match file_name.rfind('.') {
        Some(i) if i > 0 => {
            let split_at = file_name_start + i;
            (&path[..split_at], &path[split_at..])
        }
        _ => (path, ""),
    }
}

/// Builds the conflict path for `original_path` at `timestamp`, per spec.md §6.
pub fn conflict_path(original_path: &str, timestamp: DateTime<Utc>) -> String {
    let (base, ext) = split_base_ext(original_path);
    format!("{base}.conflict.{}{ext}", timestamp.format("%Y%m%d%H%M%S"))
}

/// Writes a conflict copy of `original_path` holding the client's bytes,
/// leaving whatever note already lives at `original_path` untouched. Always
/// inserted with `action = Create` — a conflict copy is a brand new note,
/// never a revision of an existing one.
pub async fn create_conflict_file(
    note_repo: &dyn NoteRepo,
    owner: Id,
    vault_id: Id,
    original_path: &str,
    client_content: String,
    client_hash: String,
    mtime: DateTime<Utc>,
    ctime: DateTime<Utc>,
) -> Result<Note> {
    let path = conflict_path(original_path, ctime);
    let note = Note {
        id: 0,
        vault_id,
        owner,
        path_hash: path_hash(&path),
        path,
        content_hash: client_hash.clone(),
        content: client_content.clone(),
        mtime,
        ctime,
        action: ResourceAction::Create,
        rename_flag: false,
        version: 0,
        last_snapshot: client_content,
        last_snapshot_hash: client_hash,
        updated_at: ctime,
        client_name: String::new(),
    };
    note_repo.create(note).await.map_err(crate::error::NoteSyncError::Local)
}
