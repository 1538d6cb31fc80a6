use bytes::Bytes;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    normalize_folder, normalize_tags, sanitize_filename, truncate_description, AccessAction,
    BulkDeleteError, BulkDeleteRequest, BulkDeleteResponse, Category, ClientInfo, FileListResponse,
    FileRecord, FileResponse, FoldersResponse, ListFilesQuery, MoveFilesRequest, Pagination,
    StatsResponse, UpdateFileRequest, UploadError, UploadResponse, UploadedFile, User,
    ACCESS_LOG_CAP, ALLOWED_MIME_TYPES, CategoryStats, MAX_BULK_IDS,
};
use crate::services::{AuthService, UserService};
use crate::storage::{local::blob_file_name, BlobStore};

/// Default and maximum page sizes for listings.
const DEFAULT_PAGE_LIMIT: i64 = 20;
const MAX_PAGE_LIMIT: i64 = 100;

/// One file in an upload batch.
pub struct UploadItem {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// File lifecycle engine
///
/// Orchestrates the blob store, crypto layer, metadata store, and quota
/// counter under one error and accounting model.
pub struct FileService;

impl FileService {
    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Upload a batch of files.
    ///
    /// The quota check covers the whole batch before any byte is persisted.
    /// Per-file failures land in the response's error slots; committed files
    /// are never rolled back. The quota counter is bumped once, after the
    /// batch, by the sum of successes.
    pub async fn upload_batch(
        db: &Database,
        store: &dyn BlobStore,
        config: &Config,
        user_id: &str,
        folder: Option<String>,
        tags: Option<crate::models::TagsInput>,
        description: Option<String>,
        items: Vec<UploadItem>,
    ) -> Result<UploadResponse> {
        if items.is_empty() {
            return Err(AppError::Validation("No files provided".to_string()));
        }
        if items.len() > config.storage.max_batch_files {
            return Err(AppError::Validation(format!(
                "At most {} files per upload",
                config.storage.max_batch_files
            )));
        }

        let user = AuthService::get_user(db, user_id).await?;

        let incoming_total: i64 = items.iter().map(|i| i.data.len() as i64).sum();
        UserService::check_quota(&user, incoming_total)?;

        let folder = normalize_folder(folder.as_deref().unwrap_or("/"))?;
        let tags_json = serde_json::to_string(
            &tags.as_ref().map(normalize_tags).unwrap_or_default(),
        )
        .unwrap_or_else(|_| "[]".to_string());
        let description = truncate_description(description.as_deref().unwrap_or(""));

        let mut files = Vec::new();
        let mut errors = Vec::new();
        let mut committed_bytes: i64 = 0;

        for item in items {
            let display_name = item.name.clone();
            let size = item.data.len() as i64;
            match Self::upload_one(db, store, config, &user, &folder, &tags_json, &description, item)
                .await
            {
                Ok(uploaded) => {
                    committed_bytes += size;
                    files.push(uploaded);
                }
                Err(e) => {
                    tracing::warn!("Upload of {} failed: {}", display_name, e);
                    errors.push(UploadError {
                        name: display_name,
                        error: e.to_string(),
                    });
                }
            }
        }

        if committed_bytes > 0 {
            UserService::update_storage_used(db, user_id, committed_bytes).await?;
        }

        Ok(UploadResponse { files, errors })
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_one(
        db: &Database,
        store: &dyn BlobStore,
        config: &Config,
        user: &User,
        folder: &str,
        tags_json: &str,
        description: &str,
        item: UploadItem,
    ) -> Result<UploadedFile> {
        let name = sanitize_filename(&item.name);

        if !ALLOWED_MIME_TYPES.contains(&item.mime_type.as_str()) {
            return Err(AppError::Validation(format!(
                "File type {} is not allowed",
                item.mime_type
            )));
        }
        if item.data.len() as u64 > config.storage.max_file_size {
            return Err(AppError::Validation(format!(
                "File exceeds the {} byte limit",
                config.storage.max_file_size
            )));
        }

        let blob_id = Uuid::new_v4().to_string();
        let blob_name = blob_file_name(&blob_id, &name);
        let size = item.data.len() as i64;
        let checksum = crypto::hash(&item.data);

        // Stage plaintext, then encrypt in place: read back, seal, overwrite.
        let staged = store.stage(&user.id, &blob_name, item.data).await?;

        let result = async {
            let plaintext = store.open_for_read(&staged).await?;
            let container = crypto::encrypt(&plaintext, &user.encryption_key)?;
            let encrypted_size = container.len() as i64;
            store.replace_contents(&staged, Bytes::from(container)).await?;
            store.commit(&staged).await?;

            let encrypted_checksum = crypto::file_checksum(&staged).await?;

            let file_id = Uuid::new_v4().to_string();
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO files (
                    id, user_id, original_name, blob_id, mime_type,
                    size, encrypted_size, checksum, encrypted_checksum,
                    storage_path, folder, tags, description, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&file_id)
            .bind(&user.id)
            .bind(&name)
            .bind(&blob_id)
            .bind(&item.mime_type)
            .bind(size)
            .bind(encrypted_size)
            .bind(&checksum)
            .bind(&encrypted_checksum)
            .bind(staged.to_string_lossy().as_ref())
            .bind(folder)
            .bind(tags_json)
            .bind(description)
            .bind(&now)
            .bind(&now)
            .execute(db.pool())
            .await?;

            Ok::<_, AppError>(UploadedFile {
                id: file_id,
                name: name.clone(),
                size,
                mime_type: item.mime_type.clone(),
                category: Category::from_mime(&item.mime_type),
                created_at: now,
            })
        }
        .await;

        if result.is_err() {
            // Never leave a staged blob behind for a failed slot.
            if let Err(e) = store.remove(&staged).await {
                tracing::error!("Failed to clean up staged blob {:?}: {}", staged, e);
            }
        }

        result
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    /// Fetch a record the caller owns. Soft-deleted rows are invisible
    /// unless `include_deleted` is set.
    pub async fn get_file(
        db: &Database,
        user_id: &str,
        file_id: &str,
        include_deleted: bool,
    ) -> Result<FileRecord> {
        let sql = if include_deleted {
            "SELECT * FROM files WHERE id = ? AND user_id = ?"
        } else {
            "SELECT * FROM files WHERE id = ? AND user_id = ? AND is_deleted = 0"
        };

        let file: FileRecord = sqlx::query_as(sql)
            .bind(file_id)
            .bind(user_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        Ok(file)
    }

    /// Get a single sanitized record, recording the view.
    pub async fn get(
        db: &Database,
        user_id: &str,
        file_id: &str,
        client: &ClientInfo,
    ) -> Result<FileResponse> {
        let file = Self::get_file(db, user_id, file_id, false).await?;
        Self::append_access_log(db, &file.id, AccessAction::View, client).await?;
        Ok(FileResponse::from(file))
    }

    /// List files with pagination, filters, search, and sorting.
    pub async fn list(
        db: &Database,
        user_id: &str,
        query: &ListFilesQuery,
        trash: bool,
    ) -> Result<FileListResponse> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1) * limit;

        let total: i64 = {
            let mut qb = Self::list_query_builder("SELECT COUNT(*) FROM files", user_id, query, trash);
            qb.build_query_scalar().fetch_one(db.pool()).await?
        };

        let files: Vec<FileRecord> = {
            let mut qb = Self::list_query_builder("SELECT * FROM files", user_id, query, trash);
            let (column, descending) = Self::parse_sort(query.sort.as_deref());
            qb.push(" ORDER BY ");
            qb.push(column);
            qb.push(if descending { " DESC" } else { " ASC" });
            qb.push(" LIMIT ");
            qb.push_bind(limit);
            qb.push(" OFFSET ");
            qb.push_bind(offset);
            qb.build_query_as().fetch_all(db.pool()).await?
        };

        Ok(FileListResponse {
            files: files.into_iter().map(FileResponse::from).collect(),
            pagination: Pagination::new(page, limit, total),
        })
    }

    /// One builder assembles every listing's WHERE clause, so hiding
    /// soft-deleted rows is not something a caller can forget.
    fn list_query_builder<'a>(
        select: &str,
        user_id: &'a str,
        query: &'a ListFilesQuery,
        trash: bool,
    ) -> QueryBuilder<'a, Sqlite> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(select);
        qb.push(" WHERE user_id = ");
        qb.push_bind(user_id);
        qb.push(if trash {
            " AND is_deleted = 1"
        } else {
            " AND is_deleted = 0"
        });

        if let Some(cat) = query.category.as_deref().and_then(Category::from_str) {
            if cat == Category::Other {
                // Everything outside the named families.
                qb.push(" AND NOT (");
                Self::push_mime_family(&mut qb, &Self::named_family_patterns());
                qb.push(")");
            } else {
                qb.push(" AND (");
                Self::push_mime_family(&mut qb, &cat.like_patterns());
                qb.push(")");
            }
        }

        if let Some(folder) = query.folder.as_deref().filter(|f| !f.is_empty()) {
            qb.push(" AND folder = ");
            qb.push_bind(folder);
        }

        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let pattern = format!("%{}%", search.trim());
            qb.push(" AND (original_name LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR tags LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR description LIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }

        qb
    }

    fn push_mime_family(qb: &mut QueryBuilder<'_, Sqlite>, patterns: &[&'static str]) {
        for (i, pattern) in patterns.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            if pattern.contains('%') {
                qb.push("mime_type LIKE ");
            } else {
                qb.push("mime_type = ");
            }
            qb.push_bind(*pattern);
        }
    }

    fn named_family_patterns() -> Vec<&'static str> {
        let mut patterns = Vec::new();
        for cat in [
            Category::Image,
            Category::Video,
            Category::Audio,
            Category::Archive,
            Category::Document,
        ] {
            patterns.extend(cat.like_patterns());
        }
        patterns.dedup();
        patterns
    }

    /// Sort keys accepted from the client, `-` prefix for descending.
    fn parse_sort(sort: Option<&str>) -> (&'static str, bool) {
        let raw = sort.unwrap_or("-createdAt").trim();
        let (key, descending) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw, false),
        };

        let column = match key {
            "createdAt" | "created_at" => "created_at",
            "updatedAt" | "updated_at" => "updated_at",
            "name" | "originalName" => "original_name",
            "size" => "size",
            "downloads" | "downloadCount" => "download_count",
            // Unknown keys fall back to newest-first.
            _ => return ("created_at", true),
        };
        (column, descending)
    }

    // ------------------------------------------------------------------
    // Download / preview
    // ------------------------------------------------------------------

    /// Load, decrypt, and integrity-check a record's blob.
    ///
    /// Shared by owner download and share consumption. On integrity failure
    /// the blob stays on disk for diagnosis.
    pub(crate) async fn read_and_decrypt(
        db: &Database,
        store: &dyn BlobStore,
        record: &FileRecord,
    ) -> Result<Vec<u8>> {
        let owner = AuthService::get_user(db, &record.user_id).await?;
        let container = store
            .open_for_read(Path::new(&record.storage_path))
            .await?;

        let plaintext = crypto::decrypt(&container, &owner.encryption_key).map_err(|e| {
            tracing::error!(
                "Decryption failed for file {} (blob {}); blob preserved",
                record.id,
                record.blob_id
            );
            e
        })?;

        if crypto::hash(&plaintext) != record.checksum {
            tracing::error!(
                "Plaintext checksum mismatch for file {} (blob {}); blob preserved",
                record.id,
                record.blob_id
            );
            return Err(AppError::IntegrityFailure);
        }

        Ok(plaintext)
    }

    /// Download a file the caller owns.
    ///
    /// The counter moves before bytes are emitted: download-count is an
    /// access indicator, not a delivery indicator.
    pub async fn download(
        db: &Database,
        store: &dyn BlobStore,
        user_id: &str,
        file_id: &str,
        client: &ClientInfo,
    ) -> Result<(FileRecord, Vec<u8>)> {
        let record = Self::get_file(db, user_id, file_id, false).await?;
        let plaintext = Self::read_and_decrypt(db, store, &record).await?;

        sqlx::query("UPDATE files SET download_count = download_count + 1 WHERE id = ?")
            .bind(&record.id)
            .execute(db.pool())
            .await?;
        Self::append_access_log(db, &record.id, AccessAction::Download, client).await?;

        Ok((record, plaintext))
    }

    /// Inline preview, restricted to images.
    pub async fn preview(
        db: &Database,
        store: &dyn BlobStore,
        user_id: &str,
        file_id: &str,
        client: &ClientInfo,
    ) -> Result<(FileRecord, Vec<u8>)> {
        let record = Self::get_file(db, user_id, file_id, false).await?;
        if !record.mime_type.to_ascii_lowercase().starts_with("image/") {
            return Err(AppError::Validation(
                "Preview is only available for image files".to_string(),
            ));
        }

        let plaintext = Self::read_and_decrypt(db, store, &record).await?;
        Self::append_access_log(db, &record.id, AccessAction::View, client).await?;

        Ok((record, plaintext))
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Update mutable metadata: name, folder, tags, description.
    pub async fn update(
        db: &Database,
        user_id: &str,
        file_id: &str,
        req: UpdateFileRequest,
        client: &ClientInfo,
    ) -> Result<FileResponse> {
        let record = Self::get_file(db, user_id, file_id, false).await?;

        let name = match req.name.as_deref() {
            Some(n) if !n.trim().is_empty() => sanitize_filename(n),
            _ => record.original_name.clone(),
        };
        let folder = match req.folder.as_deref() {
            Some(f) => normalize_folder(f)?,
            None => record.folder.clone(),
        };
        let tags_json = match req.tags.as_ref() {
            Some(input) => serde_json::to_string(&normalize_tags(input))
                .unwrap_or_else(|_| "[]".to_string()),
            None => record.tags.clone(),
        };
        let description = match req.description.as_deref() {
            Some(d) => truncate_description(d),
            None => record.description.clone(),
        };

        sqlx::query(
            r#"
            UPDATE files
            SET original_name = ?, folder = ?, tags = ?, description = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&name)
        .bind(&folder)
        .bind(&tags_json)
        .bind(&description)
        .bind(Utc::now().to_rfc3339())
        .bind(&record.id)
        .execute(db.pool())
        .await?;

        Self::append_access_log(db, &record.id, AccessAction::Update, client).await?;

        let updated = Self::get_file(db, user_id, file_id, false).await?;
        Ok(FileResponse::from(updated))
    }

    /// Soft delete: hide the record, keep blob and quota. Idempotent.
    pub async fn soft_delete(
        db: &Database,
        user_id: &str,
        file_id: &str,
        client: &ClientInfo,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE files
            SET is_deleted = 1, deleted_at = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND is_deleted = 0
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(file_id)
        .bind(user_id)
        .execute(db.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Already in the target state, or not ours at all.
            Self::get_file(db, user_id, file_id, true).await?;
            return Ok(());
        }

        Self::append_access_log(db, file_id, AccessAction::Delete, client).await?;
        Ok(())
    }

    /// Restore a soft-deleted file. Idempotent.
    pub async fn restore(db: &Database, user_id: &str, file_id: &str) -> Result<FileResponse> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET is_deleted = 0, deleted_at = NULL, updated_at = ?
            WHERE id = ? AND user_id = ? AND is_deleted = 1
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(file_id)
        .bind(user_id)
        .execute(db.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Verify the record exists before calling this idempotent.
            Self::get_file(db, user_id, file_id, true).await?;
        }

        let record = Self::get_file(db, user_id, file_id, false).await?;
        Ok(FileResponse::from(record))
    }

    /// Permanently delete: unlink the blob, refund quota, drop the record.
    pub async fn permanent_delete(
        db: &Database,
        store: &dyn BlobStore,
        user_id: &str,
        file_id: &str,
    ) -> Result<()> {
        let record = Self::get_file(db, user_id, file_id, true).await?;
        Self::purge_record(db, store, &record).await
    }

    async fn purge_record(
        db: &Database,
        store: &dyn BlobStore,
        record: &FileRecord,
    ) -> Result<()> {
        // A failed unlink leaves an orphan for the GC sweep; metadata
        // deletion proceeds regardless.
        if let Err(e) = store.remove(Path::new(&record.storage_path)).await {
            tracing::warn!(
                "Failed to remove blob {} for file {}: {}",
                record.blob_id,
                record.id,
                e
            );
        }

        UserService::update_storage_used(db, &record.user_id, -record.size).await?;

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(&record.id)
            .execute(db.pool())
            .await?;

        Ok(())
    }

    /// Delete up to 100 files; failures are collected per id.
    pub async fn bulk_delete(
        db: &Database,
        store: &dyn BlobStore,
        user_id: &str,
        req: BulkDeleteRequest,
        client: &ClientInfo,
    ) -> Result<BulkDeleteResponse> {
        if req.file_ids.is_empty() {
            return Err(AppError::Validation("No file ids provided".to_string()));
        }
        if req.file_ids.len() > MAX_BULK_IDS {
            return Err(AppError::Validation(format!(
                "At most {} files per bulk delete",
                MAX_BULK_IDS
            )));
        }

        let mut deleted = 0i64;
        let mut errors = Vec::new();

        for id in &req.file_ids {
            let result = if req.permanent {
                Self::permanent_delete(db, store, user_id, id).await
            } else {
                Self::soft_delete(db, user_id, id, client).await
            };

            match result {
                Ok(()) => deleted += 1,
                Err(e) => errors.push(BulkDeleteError {
                    id: id.clone(),
                    error: e.to_string(),
                }),
            }
        }

        Ok(BulkDeleteResponse { deleted, errors })
    }

    /// Purge every soft-deleted file the user has.
    pub async fn empty_trash(
        db: &Database,
        store: &dyn BlobStore,
        user_id: &str,
    ) -> Result<BulkDeleteResponse> {
        let trashed: Vec<FileRecord> =
            sqlx::query_as("SELECT * FROM files WHERE user_id = ? AND is_deleted = 1")
                .bind(user_id)
                .fetch_all(db.pool())
                .await?;

        let mut deleted = 0i64;
        let mut errors = Vec::new();

        for record in &trashed {
            match Self::purge_record(db, store, record).await {
                Ok(()) => deleted += 1,
                Err(e) => errors.push(BulkDeleteError {
                    id: record.id.clone(),
                    error: e.to_string(),
                }),
            }
        }

        Ok(BulkDeleteResponse { deleted, errors })
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Aggregate stats over the user's live files.
    pub async fn stats(db: &Database, user_id: &str) -> Result<StatsResponse> {
        let (total_files, total_size): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM files WHERE user_id = ? AND is_deleted = 0",
        )
        .bind(user_id)
        .fetch_one(db.pool())
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT mime_type, size FROM files WHERE user_id = ? AND is_deleted = 0",
        )
        .bind(user_id)
        .fetch_all(db.pool())
        .await?;

        let mut categories: HashMap<String, CategoryStats> = Category::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), CategoryStats::default()))
            .collect();
        for (mime, size) in rows {
            let entry = categories
                .entry(Category::from_mime(&mime).as_str().to_string())
                .or_default();
            entry.count += 1;
            entry.size += size;
        }

        let recent: Vec<FileRecord> = sqlx::query_as(
            "SELECT * FROM files WHERE user_id = ? AND is_deleted = 0 ORDER BY created_at DESC LIMIT 5",
        )
        .bind(user_id)
        .fetch_all(db.pool())
        .await?;

        let most_downloaded: Vec<FileRecord> = sqlx::query_as(
            "SELECT * FROM files WHERE user_id = ? AND is_deleted = 0 ORDER BY download_count DESC, created_at DESC LIMIT 5",
        )
        .bind(user_id)
        .fetch_all(db.pool())
        .await?;

        Ok(StatsResponse {
            total_files,
            total_size,
            categories,
            recent_uploads: recent.into_iter().map(FileResponse::from).collect(),
            most_downloaded: most_downloaded.into_iter().map(FileResponse::from).collect(),
        })
    }

    /// Distinct folders with per-folder file counts.
    pub async fn folders(db: &Database, user_id: &str) -> Result<FoldersResponse> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT folder, COUNT(*)
            FROM files
            WHERE user_id = ? AND is_deleted = 0
            GROUP BY folder
            ORDER BY folder
            "#,
        )
        .bind(user_id)
        .fetch_all(db.pool())
        .await?;

        let folders: Vec<String> = rows.iter().map(|(f, _)| f.clone()).collect();
        let file_counts: HashMap<String, i64> = rows.into_iter().collect();

        Ok(FoldersResponse {
            folders,
            file_counts,
        })
    }

    /// Move a set of owned files into a folder.
    pub async fn move_files(
        db: &Database,
        user_id: &str,
        req: MoveFilesRequest,
    ) -> Result<u64> {
        if req.file_ids.is_empty() {
            return Err(AppError::Validation("No file ids provided".to_string()));
        }

        let folder = normalize_folder(&req.target_folder)?;
        let now = Utc::now().to_rfc3339();

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE files SET folder = ");
        qb.push_bind(&folder);
        qb.push(", updated_at = ");
        qb.push_bind(&now);
        qb.push(" WHERE user_id = ");
        qb.push_bind(user_id);
        qb.push(" AND is_deleted = 0 AND id IN (");
        let mut separated = qb.separated(", ");
        for id in &req.file_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let result = qb.build().execute(db.pool()).await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Access log
    // ------------------------------------------------------------------

    /// Append an access-log entry, trimming the ring to its cap.
    pub(crate) async fn append_access_log(
        db: &Database,
        file_id: &str,
        action: AccessAction,
        client: &ClientInfo,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO access_logs (file_id, action, ip, user_agent, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(file_id)
        .bind(action.as_str())
        .bind(&client.ip)
        .bind(&client.user_agent)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;

        sqlx::query(
            r#"
            DELETE FROM access_logs
            WHERE file_id = ?
              AND id NOT IN (
                  SELECT id FROM access_logs WHERE file_id = ? ORDER BY id DESC LIMIT ?
              )
            "#,
        )
        .bind(file_id)
        .bind(file_id)
        .bind(ACCESS_LOG_CAP)
        .execute(db.pool())
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::models::RegisterRequest;
    use crate::storage::LocalBlobStore;
    use tempfile::TempDir;

    struct Fixture {
        _db_dir: TempDir,
        _blob_dir: TempDir,
        db: Database,
        store: LocalBlobStore,
        config: Config,
        user_id: String,
    }

    async fn setup() -> Fixture {
        let (_db_dir, db) = test_db().await;
        let blob_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(blob_dir.path());
        let config = Config::default();

        let user_id = AuthService::register(
            &db,
            &config,
            RegisterRequest {
                username: "alice".to_string(),
                email: "alice@x.y".to_string(),
                password: "Aa1!aaaa".to_string(),
                confirm_password: "Aa1!aaaa".to_string(),
            },
        )
        .await
        .unwrap()
        .user
        .id;

        Fixture {
            _db_dir,
            _blob_dir: blob_dir,
            db,
            store,
            config,
            user_id,
        }
    }

    fn item(name: &str, mime: &str, data: Vec<u8>) -> UploadItem {
        UploadItem {
            name: name.to_string(),
            mime_type: mime.to_string(),
            data: Bytes::from(data),
        }
    }

    async fn upload_single(fx: &Fixture, name: &str, mime: &str, data: Vec<u8>) -> UploadedFile {
        let mut resp = FileService::upload_batch(
            &fx.db,
            &fx.store,
            &fx.config,
            &fx.user_id,
            None,
            None,
            None,
            vec![item(name, mime, data)],
        )
        .await
        .unwrap();
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        resp.files.remove(0)
    }

    #[tokio::test]
    async fn upload_download_roundtrip() {
        let fx = setup().await;
        let data = vec![0x41u8; 1024];

        let uploaded = upload_single(&fx, "a.txt", "text/plain", data.clone()).await;
        assert_eq!(uploaded.size, 1024);
        assert_eq!(uploaded.category, Category::Document);

        let record = FileService::get_file(&fx.db, &fx.user_id, &uploaded.id, false)
            .await
            .unwrap();
        assert_eq!(record.checksum, crypto::hash(&data));
        assert_eq!(record.encrypted_size, 1024 + crypto::HEADER_LEN as i64);
        // Ciphertext checksum matches what sits on disk.
        assert_eq!(
            record.encrypted_checksum,
            crypto::file_checksum(Path::new(&record.storage_path))
                .await
                .unwrap()
        );

        let (rec, plaintext) =
            FileService::download(&fx.db, &fx.store, &fx.user_id, &uploaded.id, &ClientInfo::default())
                .await
                .unwrap();
        assert_eq!(plaintext, data);
        assert_eq!(rec.size, 1024);

        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 1024);

        let after = FileService::get_file(&fx.db, &fx.user_id, &uploaded.id, false)
            .await
            .unwrap();
        assert_eq!(after.download_count, 1);
    }

    #[tokio::test]
    async fn blob_on_disk_is_never_plaintext() {
        let fx = setup().await;
        let data = b"very identifiable plaintext payload".to_vec();
        let uploaded = upload_single(&fx, "p.txt", "text/plain", data.clone()).await;

        let record = FileService::get_file(&fx.db, &fx.user_id, &uploaded.id, false)
            .await
            .unwrap();
        let on_disk = tokio::fs::read(&record.storage_path).await.unwrap();
        assert_eq!(on_disk.len(), data.len() + crypto::HEADER_LEN);
        assert!(!on_disk
            .windows(data.len())
            .any(|w| w == data.as_slice()));
    }

    #[tokio::test]
    async fn tampered_blob_fails_download_and_keeps_blob() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![0x41u8; 1024]).await;
        let record = FileService::get_file(&fx.db, &fx.user_id, &uploaded.id, false)
            .await
            .unwrap();

        let mut blob = tokio::fs::read(&record.storage_path).await.unwrap();
        blob[100] ^= 0x01;
        tokio::fs::write(&record.storage_path, &blob).await.unwrap();

        let err =
            FileService::download(&fx.db, &fx.store, &fx.user_id, &uploaded.id, &ClientInfo::default())
                .await
                .unwrap_err();
        assert!(matches!(err, AppError::IntegrityFailure));

        // Evidence preserved, quota untouched.
        assert!(Path::new(&record.storage_path).exists());
        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 1024);
    }

    #[tokio::test]
    async fn quota_cliff_rejects_whole_batch() {
        let fx = setup().await;
        sqlx::query("UPDATE users SET storage_limit = 1048576, storage_used = 921600 WHERE id = ?")
            .bind(&fx.user_id)
            .execute(fx.db.pool())
            .await
            .unwrap();

        let err = FileService::upload_batch(
            &fx.db,
            &fx.store,
            &fx.config,
            &fx.user_id,
            None,
            None,
            None,
            vec![item("big.bin", "application/octet-stream", vec![0u8; 204_800])],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));

        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 921_600);
        assert!(fx.store.list_blobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disallowed_mime_fills_error_slot_without_aborting_batch() {
        let fx = setup().await;
        let resp = FileService::upload_batch(
            &fx.db,
            &fx.store,
            &fx.config,
            &fx.user_id,
            None,
            None,
            None,
            vec![
                item("ok.txt", "text/plain", vec![1u8; 10]),
                item("bad.exe", "application/x-msdownload", vec![2u8; 10]),
            ],
        )
        .await
        .unwrap();

        assert_eq!(resp.files.len(), 1);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].name, "bad.exe");

        // Only the committed file counts against quota.
        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 10);
    }

    #[tokio::test]
    async fn batch_size_cap() {
        let fx = setup().await;
        let items: Vec<UploadItem> = (0..11)
            .map(|i| item(&format!("f{}.txt", i), "text/plain", vec![0u8; 4]))
            .collect();
        let err = FileService::upload_batch(
            &fx.db, &fx.store, &fx.config, &fx.user_id, None, None, None, items,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn soft_delete_hides_restore_reveals_quota_constant() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![0x41u8; 512]).await;

        FileService::soft_delete(&fx.db, &fx.user_id, &uploaded.id, &ClientInfo::default())
            .await
            .unwrap();
        // Idempotent.
        FileService::soft_delete(&fx.db, &fx.user_id, &uploaded.id, &ClientInfo::default())
            .await
            .unwrap();

        let active = FileService::list(&fx.db, &fx.user_id, &ListFilesQuery::default(), false)
            .await
            .unwrap();
        assert!(active.files.is_empty());

        let trash = FileService::list(&fx.db, &fx.user_id, &ListFilesQuery::default(), true)
            .await
            .unwrap();
        assert_eq!(trash.files.len(), 1);
        assert!(trash.files[0].is_deleted);

        // Trashed files still count.
        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 512);

        FileService::restore(&fx.db, &fx.user_id, &uploaded.id)
            .await
            .unwrap();
        let active = FileService::list(&fx.db, &fx.user_id, &ListFilesQuery::default(), false)
            .await
            .unwrap();
        assert_eq!(active.files.len(), 1);
        assert!(!active.files[0].is_deleted);

        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 512);
    }

    #[tokio::test]
    async fn permanent_delete_refunds_quota_and_unlinks() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![0x41u8; 2048]).await;
        let record = FileService::get_file(&fx.db, &fx.user_id, &uploaded.id, false)
            .await
            .unwrap();

        FileService::permanent_delete(&fx.db, &fx.store, &fx.user_id, &uploaded.id)
            .await
            .unwrap();

        assert!(!Path::new(&record.storage_path).exists());
        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 0);

        let err = FileService::get_file(&fx.db, &fx.user_id, &uploaded.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn permanent_delete_survives_missing_blob() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![0x41u8; 100]).await;
        let record = FileService::get_file(&fx.db, &fx.user_id, &uploaded.id, false)
            .await
            .unwrap();

        tokio::fs::remove_file(&record.storage_path).await.unwrap();

        FileService::permanent_delete(&fx.db, &fx.store, &fx.user_id, &uploaded.id)
            .await
            .unwrap();
        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 0);
    }

    #[tokio::test]
    async fn empty_trash_purges_only_deleted() {
        let fx = setup().await;
        let keep = upload_single(&fx, "keep.txt", "text/plain", vec![1u8; 100]).await;
        let toss = upload_single(&fx, "toss.txt", "text/plain", vec![2u8; 200]).await;

        FileService::soft_delete(&fx.db, &fx.user_id, &toss.id, &ClientInfo::default())
            .await
            .unwrap();
        let resp = FileService::empty_trash(&fx.db, &fx.store, &fx.user_id)
            .await
            .unwrap();
        assert_eq!(resp.deleted, 1);

        FileService::get_file(&fx.db, &fx.user_id, &keep.id, false)
            .await
            .unwrap();
        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 100);
    }

    #[tokio::test]
    async fn bulk_delete_collects_per_id_errors() {
        let fx = setup().await;
        let a = upload_single(&fx, "a.txt", "text/plain", vec![1u8; 10]).await;
        let b = upload_single(&fx, "b.txt", "text/plain", vec![2u8; 10]).await;

        let resp = FileService::bulk_delete(
            &fx.db,
            &fx.store,
            &fx.user_id,
            BulkDeleteRequest {
                file_ids: vec![a.id.clone(), "missing-id".to_string(), b.id.clone()],
                permanent: true,
            },
            &ClientInfo::default(),
        )
        .await
        .unwrap();

        assert_eq!(resp.deleted, 2);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].id, "missing-id");

        let user = AuthService::get_user(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(user.storage_used, 0);
    }

    #[tokio::test]
    async fn update_sanitizes_and_caps_fields() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![1u8; 10]).await;

        let updated = FileService::update(
            &fx.db,
            &fx.user_id,
            &uploaded.id,
            UpdateFileRequest {
                name: Some("../evil<name>.txt".to_string()),
                folder: Some("docs/work".to_string()),
                tags: Some(crate::models::TagsInput::Csv("a, b, c".to_string())),
                description: Some("d".repeat(600)),
            },
            &ClientInfo::default(),
        )
        .await
        .unwrap();

        assert_eq!(updated.original_name, ".._evil_name_.txt");
        assert_eq!(updated.folder, "/docs/work");
        assert_eq!(updated.tags, vec!["a", "b", "c"]);
        assert_eq!(updated.description.chars().count(), 500);
        // Immutable fields unchanged.
        assert_eq!(updated.size, 10);
        assert_eq!(updated.mime_type, "text/plain");
    }

    #[tokio::test]
    async fn list_filters_category_folder_and_search() {
        let fx = setup().await;
        upload_single(&fx, "cat.png", "image/png", vec![1u8; 10]).await;
        upload_single(&fx, "notes.txt", "text/plain", vec![2u8; 10]).await;
        let moved = upload_single(&fx, "plan.pdf", "application/pdf", vec![3u8; 10]).await;

        FileService::move_files(
            &fx.db,
            &fx.user_id,
            MoveFilesRequest {
                file_ids: vec![moved.id.clone()],
                target_folder: "work".to_string(),
            },
        )
        .await
        .unwrap();

        let images = FileService::list(
            &fx.db,
            &fx.user_id,
            &ListFilesQuery {
                category: Some("image".to_string()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(images.files.len(), 1);
        assert_eq!(images.files[0].original_name, "cat.png");

        let in_work = FileService::list(
            &fx.db,
            &fx.user_id,
            &ListFilesQuery {
                folder: Some("/work".to_string()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(in_work.files.len(), 1);
        assert_eq!(in_work.files[0].original_name, "plan.pdf");

        let found = FileService::list(
            &fx.db,
            &fx.user_id,
            &ListFilesQuery {
                search: Some("notes".to_string()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(found.files.len(), 1);

        let all = FileService::list(&fx.db, &fx.user_id, &ListFilesQuery::default(), false)
            .await
            .unwrap();
        assert_eq!(all.pagination.total, 3);
        assert_eq!(all.pagination.pages, 1);
    }

    #[tokio::test]
    async fn list_sort_and_pagination() {
        let fx = setup().await;
        for i in 0..3 {
            upload_single(&fx, &format!("f{}.txt", i), "text/plain", vec![0u8; (i + 1) * 10]).await;
        }

        let by_size = FileService::list(
            &fx.db,
            &fx.user_id,
            &ListFilesQuery {
                sort: Some("-size".to_string()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(by_size.files[0].size, 30);

        let page2 = FileService::list(
            &fx.db,
            &fx.user_id,
            &ListFilesQuery {
                limit: Some(2),
                page: Some(2),
                sort: Some("size".to_string()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(page2.files.len(), 1);
        assert_eq!(page2.pagination.pages, 2);
        assert_eq!(page2.files[0].size, 30);
    }

    #[tokio::test]
    async fn preview_rejects_non_images() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![1u8; 10]).await;
        let err =
            FileService::preview(&fx.db, &fx.store, &fx.user_id, &uploaded.id, &ClientInfo::default())
                .await
                .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn stats_and_folders_aggregate_live_files() {
        let fx = setup().await;
        upload_single(&fx, "cat.png", "image/png", vec![1u8; 100]).await;
        let gone = upload_single(&fx, "gone.txt", "text/plain", vec![2u8; 50]).await;
        FileService::soft_delete(&fx.db, &fx.user_id, &gone.id, &ClientInfo::default())
            .await
            .unwrap();

        let stats = FileService::stats(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_size, 100);
        assert_eq!(stats.categories["image"].count, 1);
        assert_eq!(stats.categories["document"].count, 0);
        assert_eq!(stats.recent_uploads.len(), 1);

        let folders = FileService::folders(&fx.db, &fx.user_id).await.unwrap();
        assert_eq!(folders.folders, vec!["/"]);
        assert_eq!(folders.file_counts["/"], 1);
    }

    #[tokio::test]
    async fn access_log_ring_is_capped() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![1u8; 10]).await;

        for _ in 0..110 {
            FileService::append_access_log(
                &fx.db,
                &uploaded.id,
                AccessAction::View,
                &ClientInfo::default(),
            )
            .await
            .unwrap();
        }

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM access_logs WHERE file_id = ?")
                .bind(&uploaded.id)
                .fetch_one(fx.db.pool())
                .await
                .unwrap();
        assert_eq!(count, ACCESS_LOG_CAP);
    }

    #[tokio::test]
    async fn files_are_invisible_across_users() {
        let fx = setup().await;
        let uploaded = upload_single(&fx, "a.txt", "text/plain", vec![1u8; 10]).await;

        let bob = AuthService::register(
            &fx.db,
            &fx.config,
            RegisterRequest {
                username: "bob".to_string(),
                email: "bob@x.y".to_string(),
                password: "Aa1!aaaa".to_string(),
                confirm_password: "Aa1!aaaa".to_string(),
            },
        )
        .await
        .unwrap()
        .user
        .id;

        let err = FileService::get_file(&fx.db, &bob, &uploaded.id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
