//! Destination drivers for the backup orchestrator and git mirror.
//!
//! A [`DestinationDriver`] is the capability set the orchestrator needs
//! against one backend kind: `send_stream`, `send_bytes`, `delete`. The
//! orchestrator is constructed against the trait object only — it never
//! inspects variant-specific fields, so adding a new backend kind never
//! touches orchestration code.
//!
//! # Example
//!
//! ```
//! use notesync_storage::{DestinationDriver, FileDestination};
//! use chrono::Utc;
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let dest = FileDestination::new(dir.path().to_path_buf());
//!
//! tokio::runtime::Runtime::new().unwrap().block_on(async {
//!     dest.send_bytes("notes/a.md", b"hello", Utc::now()).await.expect("send");
//!     dest.delete("notes/a.md").await.expect("delete");
//! });
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Which backend kind a [`DestinationConfig`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Local filesystem, under a configured root.
    #[default]
    Local,
    /// S3-family object storage (aliases: S3, OSS, R2, MinIO — all speak the
    /// S3 API, differing only in endpoint).
    S3,
    /// WebDAV.
    WebDav,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Local => write!(f, "local"),
            StorageType::S3 => write!(f, "s3"),
            StorageType::WebDav => write!(f, "webdav"),
        }
    }
}

impl std::str::FromStr for StorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" | "local" => Ok(StorageType::Local),
            "s3" | "oss" | "r2" | "minio" => Ok(StorageType::S3),
            "webdav" | "dav" => Ok(StorageType::WebDav),
            _ => anyhow::bail!("unknown storage type: {}", s),
        }
    }
}

/// The capability set the orchestrator needs against one destination.
///
/// Destinations must be idempotent over `(path, content)`: repeated sends
/// with equal bytes are acceptable, and repeated deletes of an already
/// missing path are not errors.
#[async_trait]
pub trait DestinationDriver: Send + Sync {
    /// Streams `reader` to `path`, returning a backend-specific URL/locator.
    async fn send_stream(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        mime: &str,
        mtime: DateTime<Utc>,
    ) -> Result<String>;

    /// Writes `bytes` to `path` in one shot.
    async fn send_bytes(&self, path: &str, bytes: &[u8], mtime: DateTime<Utc>) -> Result<String>;

    /// Deletes `path`. Not an error if `path` is already absent.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Typed configuration bundle for constructing a [`DestinationDriver`].
/// The orchestrator only ever sees this struct and the resulting trait
/// object — never a variant-specific type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub storage_type: StorageType,
    /// Bucket/container name (S3, WebDAV share name); root directory for
    /// local storage.
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub base_path: String,
    /// Custom endpoint for S3-compatible services or a WebDAV base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    pub is_enabled: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Local,
            bucket: String::new(),
            region: None,
            base_path: String::new(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            is_enabled: true,
        }
    }
}

impl DestinationConfig {
    pub fn local(base_path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Local,
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.storage_type {
            StorageType::Local => {}
            StorageType::S3 | StorageType::WebDav => {
                if self.bucket.is_empty() {
                    anyhow::bail!("bucket/container name is required for {}", self.storage_type);
                }
            }
        }
        Ok(())
    }
}

/// Builds the driver for a destination config. Only the local filesystem
/// variant is implemented so far; S3 and WebDAV are recognized kinds whose
/// wiring is left for a follow-up once a concrete SDK is chosen.
pub fn build_destination(config: &DestinationConfig) -> Result<Box<dyn DestinationDriver>> {
    config.validate()?;

    match config.storage_type {
        StorageType::Local => Ok(Box::new(FileDestination::new(PathBuf::from(&config.base_path)))),
        StorageType::S3 => anyhow::bail!("S3 destinations are not yet implemented"),
        StorageType::WebDav => anyhow::bail!("WebDAV destinations are not yet implemented"),
    }
}

/// Local filesystem destination: writes under a configured root, preserving
/// the caller-supplied mtime.
#[derive(Debug, Clone)]
pub struct FileDestination {
    root: PathBuf,
}

impl FileDestination {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn write_atomic(&self, path: &str, data: &[u8], mtime: DateTime<Utc>) -> Result<String> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        let tmp = full.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .with_context(|| format!("failed to rename file to: {}", full.display()))?;

        set_mtime(&full, mtime)?;
        Ok(format!("file://{}", full.display()))
    }
}

#[async_trait]
impl DestinationDriver for FileDestination {
    async fn send_stream(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        _mime: &str,
        mtime: DateTime<Utc>,
    ) -> Result<String> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.context("failed to read source stream")?;
        self.write_atomic(path, &buf, mtime).await
    }

    async fn send_bytes(&self, path: &str, bytes: &[u8], mtime: DateTime<Utc>) -> Result<String> {
        self.write_atomic(path, bytes, mtime).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete file: {}", full.display())),
        }
    }
}

fn set_mtime(path: &std::path::Path, mtime: DateTime<Utc>) -> Result<()> {
    let system_time: std::time::SystemTime = mtime.into();
    let file = std::fs::File::open(path).with_context(|| format!("failed to open for mtime update: {}", path.display()))?;
    file.set_modified(system_time)
        .with_context(|| format!("failed to set mtime on: {}", path.display()))
}
