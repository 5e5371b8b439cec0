//! Archive builder (C3): materializes iterator output into a temp tree and
//! packages it into a single ZIP.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_types::{BackupType, Id};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::{NoteSyncError, Result};
use crate::iterator::{ResourceRecord, ResourceSink};

/// `backup_<type>_<owner>_<vault>_<yyyyMMdd_HHmmss>.zip` (spec.md §4.5, §6).
pub fn archive_file_name(backup_type: BackupType, owner: Id, vault_name: &str, at: DateTime<Utc>) -> String {
    let kind = match backup_type {
        BackupType::Full => "full",
        BackupType::Incremental => "incremental",
        BackupType::Sync => "sync",
    };
    format!("backup_{kind}_{owner}_{vault_name}_{}.zip", at.format("%Y%m%d_%H%M%S"))
}

/// What packaging produced: either a freshly written archive with its
/// counts, or the "no updates" sentinel for an empty run (spec.md §4.3:
/// "On an empty run (count=0) the archive is not created").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Created { file_count: u64, total_size: u64 },
    NoUpdates,
}

/// A [`ResourceSink`] that writes every non-deleted record under a working
/// directory, ready for [`package_zip`].
pub struct ArchiveWriter {
    workdir: PathBuf,
    file_count: u64,
    total_size: u64,
}

impl ArchiveWriter {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir, file_count: 0, total_size: 0 }
    }

    pub fn file_count(&self) -> u64 {
        self.file_count
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

#[async_trait]
impl ResourceSink for ArchiveWriter {
    async fn handle(&mut self, record: ResourceRecord) -> Result<()> {
        if record.deleted {
            // Deleted records are skipped: the archive represents positive state only.
            return Ok(());
        }

        let bytes = resolve_bytes(&record).await?;
        let dest = self.workdir.join(&record.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| NoteSyncError::Local(e.into()))?;
        }
        tokio::fs::write(&dest, &bytes).await.map_err(|e| NoteSyncError::Local(e.into()))?;

        self.file_count += 1;
        self.total_size += bytes.len() as u64;
        Ok(())
    }
}

async fn resolve_bytes(record: &ResourceRecord) -> Result<Vec<u8>> {
    if let Some(bytes) = &record.bytes {
        return Ok(bytes.clone());
    }
    if let Some(path) = &record.local_path {
        return tokio::fs::read(path).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound { Ok(Vec::new()) } else { Err(NoteSyncError::Local(e.into())) }
        });
    }
    Ok(Vec::new())
}

/// Packages `workdir`'s tree into a ZIP at `zip_path`, which must live
/// outside `workdir` (otherwise the in-progress archive would walk itself).
/// Returns [`ArchiveOutcome::NoUpdates`] without creating the file when
/// `file_count == 0`.
pub fn package_zip(workdir: &Path, zip_path: &Path, file_count: u64, total_size: u64) -> Result<ArchiveOutcome> {
    if file_count == 0 {
        return Ok(ArchiveOutcome::NoUpdates);
    }

    let file = std::fs::File::create(zip_path).map_err(|e| NoteSyncError::Local(e.into()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(workdir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(workdir).map_err(|e| NoteSyncError::Local(e.into()))?;
        writer
            .start_file(rel.to_string_lossy(), options)
            .map_err(|e| NoteSyncError::Local(e.into()))?;
        let data = std::fs::read(entry.path()).map_err(|e| NoteSyncError::Local(e.into()))?;
        writer.write_all(&data).map_err(|e| NoteSyncError::Local(e.into()))?;
    }

    writer.finish().map_err(|e| NoteSyncError::Local(e.into()))?;
    Ok(ArchiveOutcome::Created { file_count, total_size })
}
