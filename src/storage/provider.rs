use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Result;

/// A blob found while walking the store root, for the orphan sweep.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Durable bytes on disk, namespaced per user.
///
/// The store holds no references of its own; it is addressed by the file
/// record. Plaintext only exists between `stage` and `replace_contents`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write incoming plaintext under the user's directory, creating it if
    /// missing. Returns the staged path.
    async fn stage(&self, user_id: &str, blob_name: &str, data: Bytes) -> Result<PathBuf>;

    /// Finalize a staged blob. Reserved for atomic rename from a temp name.
    async fn commit(&self, path: &Path) -> Result<()>;

    /// Overwrite a staged file with its encrypted container.
    async fn replace_contents(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Read a blob back. A missing file surfaces as `MissingBlob`.
    async fn open_for_read(&self, path: &Path) -> Result<Bytes>;

    /// Idempotent unlink; a missing file is not an error.
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Walk every blob in the store, with modification times.
    async fn list_blobs(&self) -> Result<Vec<BlobEntry>>;
}
