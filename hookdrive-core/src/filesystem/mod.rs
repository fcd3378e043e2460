//! Path-addressed file operations over the chunk manager and the metadata
//! store. Writes replace whole files; a commit installs the new manifest under
//! a per-path lock and reclaims the one it supersedes once no read still
//! streams it.

mod handle;
mod lease;
mod lock;

pub use handle::{FileHandle, OpenMode, ReadStream, WRITE_PIPE_CAPACITY, WriteSession};
pub use lock::PathLocks;

use crate::manager::Manager;
use crate::manifest::Manifest;
use crate::metadata::{Entry, MetadataStore};
use crate::path::{self, normalize_path};
use crate::{DriveError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use handle::HandleState;
use lease::ManifestLeases;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncRead;

/// What `stat` and `list` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub is_dir: bool,
}

impl From<&Entry> for FileInfo {
    fn from(entry: &Entry) -> Self {
        Self {
            path: entry.path.clone(),
            name: entry.name().to_string(),
            size: entry.size,
            modified_at: entry.modified_at,
            is_dir: entry.is_dir(),
        }
    }
}

/// Filesystem surface shared by every protocol front-end.
#[async_trait]
pub trait DriveFs: Send + Sync {
    /// Read mode needs a file with committed content. Write mode creates the
    /// file record when missing and starts a streaming session.
    async fn open(&self, path: &str, mode: OpenMode) -> Result<FileHandle>;

    async fn create(&self, path: &str) -> Result<FileHandle> {
        self.open(path, OpenMode::Write).await
    }

    /// Bytes `[offset, offset + length)` of the content committed right now.
    /// The stream keeps yielding that version even if a commit replaces it.
    async fn read(&self, handle: &FileHandle, offset: u64, length: u64) -> Result<ReadStream>;

    async fn write(&self, handle: &mut FileHandle, data: &[u8]) -> Result<usize>;

    /// Finalizes a write session. Closing a read handle is a no-op.
    async fn close(&self, handle: FileHandle) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    async fn mkdir(&self, path: &str) -> Result<FileInfo>;

    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Replaces the file at `path` with everything `reader` yields.
    async fn write_all(
        &self,
        path: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<FileInfo>;

    async fn read_all(&self, path: &str) -> Result<Bytes>;
}

pub struct VirtualFs {
    manager: Arc<Manager>,
    meta: Arc<dyn MetadataStore>,
    locks: PathLocks,
    leases: Arc<ManifestLeases>,
}

impl VirtualFs {
    pub fn new(manager: Arc<Manager>, meta: Arc<dyn MetadataStore>) -> Self {
        Self {
            leases: Arc::new(ManifestLeases::new(manager.clone())),
            manager,
            meta,
            locks: PathLocks::new(),
        }
    }

    fn committed_manifest(&self, path: &str) -> Result<(Entry, Manifest)> {
        match self.meta.get(path)? {
            None => Err(DriveError::NotFound(path.to_string())),
            Some(entry) if entry.is_dir() => Err(DriveError::IsADirectory(path.to_string())),
            Some(entry) => {
                let manifest = entry
                    .manifest
                    .clone()
                    .ok_or_else(|| DriveError::NotFound(path.to_string()))?;
                Ok((entry, manifest))
            }
        }
    }

    /// Installs `manifest` as the content of `path`. On any failure the new
    /// chunks are reclaimed and the previous content stays in place.
    async fn commit(&self, path: &str, manifest: Manifest) -> Result<Entry> {
        let outcome = {
            let _guard = self.locks.lock(path).await;
            match self.meta.get(path) {
                Ok(Some(current)) if current.is_file() => self
                    .meta
                    .commit_manifest(path, current.version, &manifest, Utc::now())
                    .map(|committed| (committed, current.manifest)),
                Ok(Some(_)) => Err(DriveError::IsADirectory(path.to_string())),
                Ok(None) => Err(DriveError::NotFound(path.to_string())),
                Err(error) => Err(error),
            }
        };

        match outcome {
            Ok((committed, previous)) => {
                tracing::info!(
                    "Committed {} ({} bytes, {} chunks, version {})",
                    path,
                    committed.size,
                    manifest.chunk_count(),
                    committed.version
                );
                if let Some(previous) = previous {
                    self.leases.retire(previous).await;
                }
                Ok(committed)
            }
            Err(error) => {
                tracing::warn!("Discarding upload for {}: {}", path, error);
                self.manager.delete(&manifest).await;
                Err(error)
            }
        }
    }

    async fn finalize(&self, path: &str, session: WriteSession) -> Result<Entry> {
        let manifest = session.finish().await.map_err(DriveError::into_io_failure)?;
        self.commit(path, manifest).await
    }
}

#[async_trait]
impl DriveFs for VirtualFs {
    async fn open(&self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let path = normalize_path(path)?;
        match mode {
            OpenMode::Read => {
                self.committed_manifest(&path)?;
                Ok(FileHandle::reader(path))
            }
            OpenMode::Write => {
                self.meta.create_file(&path)?;
                tracing::debug!("Opened {} for writing", path);
                Ok(FileHandle::writer(path, WriteSession::start(&self.manager)))
            }
        }
    }

    async fn read(&self, handle: &FileHandle, offset: u64, length: u64) -> Result<ReadStream> {
        match handle.state {
            HandleState::Read => {}
            HandleState::Write(_) => {
                return Err(DriveError::InvalidRequest(format!(
                    "{} is open for writing",
                    handle.path()
                )));
            }
            HandleState::Closed => {
                return Err(DriveError::InvalidRequest(format!(
                    "{} is closed",
                    handle.path()
                )));
            }
        }

        let (manifest, lease) = self
            .leases
            .pin(|| self.committed_manifest(handle.path()).map(|(_, manifest)| manifest))?;
        let stream = self
            .manager
            .get(&manifest, offset, length)?
            .map(|piece| piece.map_err(DriveError::into_io_failure));
        Ok(ReadStream::new(
            &manifest,
            offset,
            length,
            Box::pin(stream),
            lease,
        ))
    }

    async fn write(&self, handle: &mut FileHandle, data: &[u8]) -> Result<usize> {
        let accepted = match &mut handle.state {
            HandleState::Write(session) => Some(session.feed(data).await),
            _ => None,
        };
        let Some(accepted) = accepted else {
            return Err(DriveError::InvalidRequest(format!(
                "{} is not open for writing",
                handle.path()
            )));
        };
        if accepted {
            return Ok(data.len());
        }

        // The upload stopped reading, so it has failed. Collect its error and
        // close the handle.
        let HandleState::Write(session) = handle.take_state() else {
            return Err(DriveError::Internal("write session vanished".to_string()));
        };
        match session.finish().await {
            Err(error) => Err(error.into_io_failure()),
            Ok(manifest) => {
                self.manager.delete(&manifest).await;
                Err(DriveError::Internal(format!(
                    "upload for {} ended before its input",
                    handle.path()
                )))
            }
        }
    }

    async fn close(&self, mut handle: FileHandle) -> Result<()> {
        match handle.take_state() {
            HandleState::Write(session) => {
                self.finalize(handle.path(), session).await?;
                Ok(())
            }
            HandleState::Read | HandleState::Closed => Ok(()),
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let path = normalize_path(path)?;
        let entry = self
            .meta
            .get(&path)?
            .ok_or_else(|| DriveError::NotFound(path.clone()))?;
        Ok(FileInfo::from(&entry))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = normalize_path(path)?;
        let entries = self.meta.list(&path)?;
        Ok(entries.iter().map(FileInfo::from).collect())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        self.meta.rename(&from, &to)?;
        tracing::info!("Renamed {} to {}", from, to);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let removed = {
            let _guard = self.locks.lock(&path).await;
            self.meta.remove_file(&path)?
        };

        tracing::info!("Removed {} ({} bytes)", path, removed.size);
        if let Some(manifest) = removed.manifest {
            self.leases.retire(manifest).await;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<FileInfo> {
        let path = normalize_path(path)?;
        if path::is_root(&path) {
            return Err(DriveError::AlreadyExists(path));
        }
        let entry = self.meta.create_dir(&path)?;
        Ok(FileInfo::from(&entry))
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        self.meta.remove_dir(&path)
    }

    async fn write_all(
        &self,
        path: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<FileInfo> {
        let path = normalize_path(path)?;
        self.meta.create_file(&path)?;

        let manifest = self
            .manager
            .put(reader)
            .await
            .map_err(DriveError::into_io_failure)?;
        let entry = self.commit(&path, manifest).await?;
        Ok(FileInfo::from(&entry))
    }

    async fn read_all(&self, path: &str) -> Result<Bytes> {
        let path = normalize_path(path)?;
        let (manifest, _lease) = self
            .leases
            .pin(|| self.committed_manifest(&path).map(|(_, manifest)| manifest))?;
        self.manager
            .read_range(&manifest, 0, manifest.size)
            .await
            .map_err(DriveError::into_io_failure)
    }
}
