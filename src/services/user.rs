use chrono::Utc;

use crate::crypto;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{StorageUsageResponse, UpdateProfileRequest, User, UserResponse};
use crate::services::AuthService;

/// User profile and quota accounting
pub struct UserService;

impl UserService {
    pub async fn get_profile(db: &Database, user_id: &str) -> Result<UserResponse> {
        let user = AuthService::get_user(db, user_id).await?;
        Ok(UserResponse::from(user))
    }

    /// Update username and/or email
    pub async fn update_profile(
        db: &Database,
        user_id: &str,
        req: UpdateProfileRequest,
    ) -> Result<UserResponse> {
        let now = Utc::now().to_rfc3339();

        if let Some(ref username) = req.username {
            AuthService::validate_username(username)?;
            let taken: Option<(String,)> =
                sqlx::query_as("SELECT id FROM users WHERE username = ? AND id != ?")
                    .bind(username)
                    .bind(user_id)
                    .fetch_optional(db.pool())
                    .await?;
            if taken.is_some() {
                return Err(AppError::AlreadyExists("Username already taken".to_string()));
            }

            let result = sqlx::query("UPDATE users SET username = ?, updated_at = ? WHERE id = ?")
                .bind(username)
                .bind(&now)
                .bind(user_id)
                .execute(db.pool())
                .await;
            if let Err(e) = result {
                if AppError::is_unique_violation(&e) {
                    return Err(AppError::AlreadyExists("Username already taken".to_string()));
                }
                return Err(e.into());
            }
        }

        if let Some(ref email) = req.email {
            let email = AuthService::validate_email(email)?;
            let taken: Option<(String,)> =
                sqlx::query_as("SELECT id FROM users WHERE email = ? AND id != ?")
                    .bind(&email)
                    .bind(user_id)
                    .fetch_optional(db.pool())
                    .await?;
            if taken.is_some() {
                return Err(AppError::AlreadyExists("Email already registered".to_string()));
            }

            let result = sqlx::query("UPDATE users SET email = ?, updated_at = ? WHERE id = ?")
                .bind(&email)
                .bind(&now)
                .bind(user_id)
                .execute(db.pool())
                .await;
            if let Err(e) = result {
                if AppError::is_unique_violation(&e) {
                    return Err(AppError::AlreadyExists("Email already registered".to_string()));
                }
                return Err(e.into());
            }
        }

        Self::get_profile(db, user_id).await
    }

    /// Storage usage for the quota widget
    pub async fn get_storage_usage(db: &Database, user_id: &str) -> Result<StorageUsageResponse> {
        let user = AuthService::get_user(db, user_id).await?;
        Ok(StorageUsageResponse {
            used: user.storage_used,
            limit: user.storage_limit,
            percentage: if user.storage_limit > 0 {
                ((user.storage_used as f64 / user.storage_limit as f64) * 100.0).round() as u8
            } else {
                0
            },
        })
    }

    /// Reject an upload batch that would not fit.
    ///
    /// The check is per request: a batch either entirely fits or is refused
    /// before any byte is persisted.
    pub fn check_quota(user: &User, incoming_total: i64) -> Result<()> {
        if user.storage_used + incoming_total > user.storage_limit {
            return Err(AppError::QuotaExceeded(
                "Storage quota exceeded".to_string(),
            ));
        }
        Ok(())
    }

    /// Adjust the storage counter. Decrements clamp at zero to tolerate
    /// drift.
    pub async fn update_storage_used(db: &Database, user_id: &str, delta: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET storage_used = MAX(0, storage_used + ?),
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(delta)
        .bind(user_id)
        .execute(db.pool())
        .await?;
        Ok(())
    }

    /// Deactivate the account. The row and its files remain for audit; the
    /// user simply can no longer authenticate.
    pub async fn deactivate_account(db: &Database, user_id: &str, password: &str) -> Result<()> {
        let user = AuthService::get_user(db, user_id).await?;

        if !crypto::password_verify(password, &user.password_hash)? {
            return Err(AppError::AuthFailure("Password is incorrect".to_string()));
        }

        sqlx::query("UPDATE users SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(user_id)
            .execute(db.pool())
            .await?;

        tracing::info!("Deactivated account {}", user.username);
        Ok(())
    }
}
