use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::provider::{BlobEntry, BlobStore};

/// Local filesystem blob store.
///
/// Layout: `<root>/<user-id>/<blob-id>.<ext>.encrypted`. The extension is
/// kept only as a hint to anyone browsing the store; the original filename
/// never becomes a path component.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// On-disk name for a blob: the blob id plus a sanitized extension hint.
pub fn blob_file_name(blob_id: &str, original_name: &str) -> String {
    let ext: String = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(10)
        .collect();

    if ext.is_empty() {
        format!("{}.encrypted", blob_id)
    } else {
        format!("{}.{}.encrypted", blob_id, ext.to_lowercase())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn stage(&self, user_id: &str, blob_name: &str, data: Bytes) -> Result<PathBuf> {
        let user_dir = self.root.join(user_id);
        fs::create_dir_all(&user_dir).await?;

        let path = user_dir.join(blob_name);
        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        tracing::debug!("Staged blob at {:?}", path);
        Ok(path)
    }

    async fn commit(&self, _path: &Path) -> Result<()> {
        // Staging writes to the final path directly; nothing to rename.
        Ok(())
    }

    async fn replace_contents(&self, path: &Path, data: Bytes) -> Result<()> {
        let mut file = fs::File::create(path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn open_for_read(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::MissingBlob("File not found in storage".to_string())
            } else {
                AppError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                tracing::debug!("Removed blob {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_blobs(&self) -> Result<Vec<BlobEntry>> {
        let mut blobs = Vec::new();

        let mut root_entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(blobs),
            Err(e) => return Err(e.into()),
        };

        while let Some(user_entry) = root_entries.next_entry().await? {
            if !user_entry.file_type().await?.is_dir() {
                continue;
            }
            let mut user_files = fs::read_dir(user_entry.path()).await?;
            while let Some(file_entry) = user_files.next_entry().await? {
                let meta = file_entry.metadata().await?;
                if !meta.is_file() {
                    continue;
                }
                blobs.push(BlobEntry {
                    path: file_entry.path(),
                    modified: meta.modified()?,
                });
            }
        }

        Ok(blobs)
    }
}
