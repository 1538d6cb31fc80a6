use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::Result;

/// Tuning applied to every fresh connection. WAL plus a 30-second busy
/// timeout covers the metadata-operation budget; foreign keys must be
/// switched on per connection or the files -> users cascade is silently
/// skipped.
const SESSION_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode=WAL;",
    "PRAGMA busy_timeout=30000;",
    "PRAGMA synchronous=NORMAL;",
    "PRAGMA foreign_keys=ON;",
];

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the metadata store at `path`.
    ///
    /// The pool is capped at one connection: every mutation path here
    /// writes, and a lone writer sidesteps SQLite lock contention entirely.
    pub async fn new(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .after_connect(|session, _meta| {
                Box::pin(async move {
                    use sqlx::Executor;
                    for pragma in SESSION_PRAGMAS {
                        session.execute(*pragma).await?;
                    }
                    Ok(())
                })
            })
            .connect(&format!("sqlite:{}?mode=rwc", path))
            .await?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                encryption_key TEXT NOT NULL,
                key_salt TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user',
                is_active INTEGER NOT NULL DEFAULT 1,
                storage_used INTEGER NOT NULL DEFAULT 0,
                storage_limit INTEGER NOT NULL DEFAULT 1073741824,
                failed_login_attempts INTEGER NOT NULL DEFAULT 0,
                locked_until TEXT,
                last_login TEXT,
                password_changed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                original_name TEXT NOT NULL,
                blob_id TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                encrypted_size INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                encrypted_checksum TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                folder TEXT NOT NULL DEFAULT '/',
                tags TEXT NOT NULL DEFAULT '[]',
                description TEXT NOT NULL DEFAULT '',
                download_count INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT,
                share_token TEXT,
                share_expires_at TEXT,
                share_max_downloads INTEGER,
                share_password_hash TEXT,
                share_download_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (user_id, blob_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Bounded per-file access trail
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS access_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id TEXT NOT NULL,
                action TEXT NOT NULL,
                ip TEXT,
                user_agent TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Unique indexes double as race detectors for concurrent writers
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_files_blob_id ON files(blob_id)")
            .execute(&self.pool)
            .await?;
        // Sparse by construction: SQLite unique indexes admit multiple NULLs
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_files_share_token ON files(share_token)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_user_created ON files(user_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_user_folder ON files(user_id, folder)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_deleted ON files(is_deleted, deleted_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_access_logs_file ON access_logs(file_id, id)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}
