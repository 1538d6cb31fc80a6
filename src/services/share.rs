use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::crypto;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    AccessAction, ClientInfo, CreateShareRequest, FileRecord, ShareResponse,
};
use crate::services::FileService;
use crate::storage::BlobStore;

/// Default share lifetime in days.
const DEFAULT_EXPIRES_IN_DAYS: i64 = 7;

/// Attempts to find an unused token before giving up. With 32 random bytes
/// a collision means the RNG is broken, not that we are unlucky.
const TOKEN_INSERT_ATTEMPTS: usize = 5;

/// Outcome of an anonymous share access.
#[derive(Debug)]
pub enum ShareConsume {
    /// The share is password-protected and no password was supplied; the
    /// transport answers 401 with the `requiresPassword` envelope.
    PasswordRequired,
    /// Decrypted, integrity-checked bytes ready to emit.
    Payload {
        record: FileRecord,
        data: Vec<u8>,
    },
}

/// Anonymous token-bearing shares on single files
pub struct ShareService;

impl ShareService {
    /// Create a share, replacing any existing one on the file.
    ///
    /// Re-creating resets the consumption counter to zero.
    pub async fn create_share(
        db: &Database,
        config: &Config,
        user_id: &str,
        file_id: &str,
        req: CreateShareRequest,
        client: &ClientInfo,
    ) -> Result<ShareResponse> {
        let file = FileService::get_file(db, user_id, file_id, false).await?;

        let expires_in = req.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_DAYS);
        if expires_in <= 0 {
            return Err(AppError::Validation(
                "Share expiry must be at least one day".to_string(),
            ));
        }
        if let Some(max) = req.max_downloads {
            if max <= 0 {
                return Err(AppError::Validation(
                    "Maximum downloads must be positive".to_string(),
                ));
            }
        }

        let expires_at = (Utc::now() + Duration::seconds(expires_in * 86_400)).to_rfc3339();
        let password_hash = match req.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => Some(crypto::password_hash(password)?),
            None => None,
        };
        let has_password = password_hash.is_some();

        let mut token = None;
        for _ in 0..TOKEN_INSERT_ATTEMPTS {
            let candidate = crypto::generate_share_token();
            let result = sqlx::query(
                r#"
                UPDATE files
                SET share_token = ?, share_expires_at = ?, share_max_downloads = ?,
                    share_password_hash = ?, share_download_count = 0, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&candidate)
            .bind(&expires_at)
            .bind(req.max_downloads)
            .bind(&password_hash)
            .bind(Utc::now().to_rfc3339())
            .bind(&file.id)
            .execute(db.pool())
            .await;

            match result {
                Ok(_) => {
                    token = Some(candidate);
                    break;
                }
                Err(e) if AppError::is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let token = token.ok_or_else(|| {
            AppError::Internal("Failed to generate a unique share token".to_string())
        })?;

        FileService::append_access_log(db, &file.id, AccessAction::Share, client).await?;
        tracing::info!("Share created for file {}", file.id);

        Ok(ShareResponse {
            share_url: format!(
                "{}/api/files/shared/{}",
                config.server.frontend_url.trim_end_matches('/'),
                token
            ),
            share_token: token,
            expires_at,
            max_downloads: req.max_downloads,
            has_password,
        })
    }

    /// Revoke a share: clear every share field in one statement.
    pub async fn revoke_share(db: &Database, user_id: &str, file_id: &str) -> Result<()> {
        let file = FileService::get_file(db, user_id, file_id, false).await?;

        sqlx::query(
            r#"
            UPDATE files
            SET share_token = NULL, share_expires_at = NULL, share_max_downloads = NULL,
                share_password_hash = NULL, share_download_count = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&file.id)
        .execute(db.pool())
        .await?;

        Ok(())
    }

    /// Consume a share anonymously.
    ///
    /// Expiry and exhaustion are derived on every access; the decrypt path
    /// runs the same integrity gate as an owner download, with the owner's
    /// key.
    pub async fn consume(
        db: &Database,
        store: &dyn BlobStore,
        token: &str,
        password: Option<String>,
        client: &ClientInfo,
    ) -> Result<ShareConsume> {
        let record: FileRecord =
            sqlx::query_as("SELECT * FROM files WHERE share_token = ? AND is_deleted = 0")
                .bind(token)
                .fetch_optional(db.pool())
                .await?
                .ok_or_else(|| AppError::NotFound("Share not found".to_string()))?;

        if let Some(expires_at) = record.share_expires_at.as_deref() {
            let expiry = DateTime::parse_from_rfc3339(expires_at)
                .map_err(|_| AppError::Internal("Invalid share expiry format".to_string()))?;
            if expiry <= Utc::now() {
                return Err(AppError::ShareExpired("Share link has expired".to_string()));
            }
        }

        if let Some(max) = record.share_max_downloads {
            if record.share_download_count >= max {
                return Err(AppError::ShareExpired(
                    "Share download limit reached".to_string(),
                ));
            }
        }

        if let Some(hash) = record.share_password_hash.as_deref() {
            let password = match password.filter(|p| !p.is_empty()) {
                Some(p) => p,
                None => return Ok(ShareConsume::PasswordRequired),
            };
            if !crypto::password_verify(&password, hash)? {
                return Err(AppError::AuthFailure("Invalid share password".to_string()));
            }
        }

        let data = FileService::read_and_decrypt(db, store, &record).await?;

        sqlx::query(
            r#"
            UPDATE files
            SET share_download_count = share_download_count + 1,
                download_count = download_count + 1
            WHERE id = ?
            "#,
        )
        .bind(&record.id)
        .execute(db.pool())
        .await?;
        FileService::append_access_log(db, &record.id, AccessAction::Download, client).await?;

        Ok(ShareConsume::Payload { record, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::models::RegisterRequest;
    use crate::services::{AuthService, FileService};
    use crate::services::file::UploadItem;
    use crate::storage::LocalBlobStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        _db_dir: TempDir,
        _blob_dir: TempDir,
        db: Database,
        store: LocalBlobStore,
        config: Config,
        user_id: String,
        file_id: String,
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

        let resp = FileService::upload_batch(
            &db,
            &store,
            &config,
            &user_id,
            None,
            None,
            None,
            vec![UploadItem {
                name: "a.txt".to_string(),
                mime_type: "text/plain".to_string(),
                data: Bytes::from(vec![0x41u8; 256]),
            }],
        )
        .await
        .unwrap();
        let file_id = resp.files[0].id.clone();

        Fixture {
            _db_dir,
            _blob_dir: blob_dir,
            db,
            store,
            config,
            user_id,
            file_id,
        }
    }

    fn share_req(password: Option<&str>, max: Option<i64>) -> CreateShareRequest {
        CreateShareRequest {
            expires_in: Some(1),
            max_downloads: max,
            password: password.map(|p| p.to_string()),
        }
    }

    async fn consume(
        fx: &Fixture,
        token: &str,
        password: Option<&str>,
    ) -> Result<ShareConsume> {
        ShareService::consume(
            &fx.db,
            &fx.store,
            token,
            password.map(|p| p.to_string()),
            &ClientInfo::default(),
        )
        .await
    }

    #[tokio::test]
    async fn share_lifecycle_with_password_and_limit() {
        let fx = setup().await;
        let share = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            &fx.file_id,
            share_req(Some("p@ss"), Some(2)),
            &ClientInfo::default(),
        )
        .await
        .unwrap();

        assert_eq!(share.share_token.len(), 64);
        assert!(share.has_password);
        assert!(share.share_url.ends_with(&share.share_token));

        // No password: handshake, not an error.
        match consume(&fx, &share.share_token, None).await.unwrap() {
            ShareConsume::PasswordRequired => {}
            _ => panic!("expected password handshake"),
        }

        // Wrong password.
        let err = consume(&fx, &share.share_token, Some("nope")).await.unwrap_err();
        assert!(matches!(err, AppError::AuthFailure(_)));

        // Two valid consumes exhaust the limit.
        for expected in 1..=2 {
            match consume(&fx, &share.share_token, Some("p@ss")).await.unwrap() {
                ShareConsume::Payload { record, data } => {
                    assert_eq!(data, vec![0x41u8; 256]);
                    assert_eq!(record.share_download_count, expected - 1);
                }
                _ => panic!("expected payload"),
            }
        }

        let err = consume(&fx, &share.share_token, Some("p@ss")).await.unwrap_err();
        assert!(matches!(err, AppError::ShareExpired(_)));

        // Revocation makes the token unknown.
        ShareService::revoke_share(&fx.db, &fx.user_id, &fx.file_id)
            .await
            .unwrap();
        let err = consume(&fx, &share.share_token, Some("p@ss")).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn consume_without_password_when_none_set() {
        let fx = setup().await;
        let share = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            &fx.file_id,
            share_req(None, None),
            &ClientInfo::default(),
        )
        .await
        .unwrap();
        assert!(!share.has_password);

        match consume(&fx, &share.share_token, None).await.unwrap() {
            ShareConsume::Payload { data, .. } => assert_eq!(data.len(), 256),
            _ => panic!("expected payload"),
        }
    }

    #[tokio::test]
    async fn expired_share_is_gone() {
        let fx = setup().await;
        let share = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            &fx.file_id,
            share_req(None, None),
            &ClientInfo::default(),
        )
        .await
        .unwrap();

        let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
        sqlx::query("UPDATE files SET share_expires_at = ? WHERE id = ?")
            .bind(&past)
            .bind(&fx.file_id)
            .execute(fx.db.pool())
            .await
            .unwrap();

        let err = consume(&fx, &share.share_token, None).await.unwrap_err();
        assert!(matches!(err, AppError::ShareExpired(_)));
    }

    #[tokio::test]
    async fn recreating_a_share_replaces_token_and_resets_count() {
        let fx = setup().await;
        let first = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            &fx.file_id,
            share_req(None, Some(5)),
            &ClientInfo::default(),
        )
        .await
        .unwrap();

        consume(&fx, &first.share_token, None).await.unwrap();

        let second = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            &fx.file_id,
            share_req(None, Some(5)),
            &ClientInfo::default(),
        )
        .await
        .unwrap();
        assert_ne!(first.share_token, second.share_token);

        // Old token is dead, new counter starts at zero.
        let err = consume(&fx, &first.share_token, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let record = FileService::get_file(&fx.db, &fx.user_id, &fx.file_id, false)
            .await
            .unwrap();
        assert_eq!(record.share_download_count, 0);
    }

    #[tokio::test]
    async fn share_on_trashed_file_is_not_consumable() {
        let fx = setup().await;
        let share = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            &fx.file_id,
            share_req(None, None),
            &ClientInfo::default(),
        )
        .await
        .unwrap();

        FileService::soft_delete(&fx.db, &fx.user_id, &fx.file_id, &ClientInfo::default())
            .await
            .unwrap();

        let err = consume(&fx, &share.share_token, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn share_creation_validates_inputs() {
        let fx = setup().await;
        let err = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            &fx.file_id,
            CreateShareRequest {
                expires_in: Some(0),
                max_downloads: None,
                password: None,
            },
            &ClientInfo::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = ShareService::create_share(
            &fx.db,
            &fx.config,
            &fx.user_id,
            "missing",
            share_req(None, None),
            &ClientInfo::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
