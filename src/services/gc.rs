//! Orphan blob collection.
//!
//! A blob without a metadata record should not exist; it appears when a
//! purge unlinks the record but the filesystem remove fails, or after a
//! crash mid-upload. The sweep walks the store root, joins each blob
//! against the files table by storage path, and unlinks orphans older than
//! a safety window.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::db::Database;
use crate::error::Result;
use crate::storage::BlobStore;

/// Minimum age before an unreferenced blob is considered orphaned.
/// In-flight uploads stage plaintext briefly; the window keeps the sweep
/// from racing them.
pub const ORPHAN_SAFETY_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Interval between background sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Remove unreferenced blobs older than `older_than`. Returns the number
/// of blobs removed.
pub async fn sweep_orphan_blobs(
    db: &Database,
    store: &dyn BlobStore,
    older_than: Duration,
) -> Result<u64> {
    let now = SystemTime::now();
    let mut removed = 0u64;

    for blob in store.list_blobs().await? {
        let age = now
            .duration_since(blob.modified)
            .unwrap_or(Duration::ZERO);
        if age < older_than {
            continue;
        }

        let path = blob.path.to_string_lossy().to_string();
        let (referenced,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM files WHERE storage_path = ?")
                .bind(&path)
                .fetch_one(db.pool())
                .await?;
        if referenced > 0 {
            continue;
        }

        match store.remove(&blob.path).await {
            Ok(()) => {
                tracing::info!("Removed orphan blob {:?}", blob.path);
                removed += 1;
            }
            Err(e) => {
                tracing::warn!("Failed to remove orphan blob {:?}: {}", blob.path, e);
            }
        }
    }

    Ok(removed)
}

/// Spawn the periodic sweep task.
pub fn spawn_sweeper(db: Database, store: Arc<dyn BlobStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match sweep_orphan_blobs(&db, store.as_ref(), ORPHAN_SAFETY_WINDOW).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Orphan sweep removed {} blobs", n),
                Err(e) => tracing::error!("Orphan sweep failed: {}", e),
            }
        }
    });
}
