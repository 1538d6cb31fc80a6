use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    AuthResponse, Claims, LoginRequest, RegisterRequest, User, UserResponse, UserRole,
};

/// Issuer claim stamped into and required from every token.
const TOKEN_ISSUER: &str = "secure-file-upload";

/// Failed logins tolerated before the account locks.
const MAX_FAILED_LOGINS: i64 = 5;
/// Lock window after too many failures.
const LOCK_DURATION_HOURS: i64 = 2;

const SPECIAL_CHARS: &str = "@$!%*?&";

/// Authentication service
pub struct AuthService;

impl AuthService {
    /// Register a new user
    ///
    /// Key material is generated before the row is first persisted, so no
    /// user ever exists without its encryption key.
    pub async fn register(db: &Database, config: &Config, req: RegisterRequest) -> Result<AuthResponse> {
        Self::validate_username(&req.username)?;
        let email = Self::validate_email(&req.email)?;
        Self::validate_password(&req.password)?;

        if req.password != req.confirm_password {
            return Err(AppError::Validation("Passwords do not match".to_string()));
        }

        // Pre-checks give precise messages; the unique indexes still settle
        // concurrent registrations at commit.
        let username_taken: Option<(String,)> =
            sqlx::query_as("SELECT id FROM users WHERE username = ?")
                .bind(&req.username)
                .fetch_optional(db.pool())
                .await?;
        if username_taken.is_some() {
            return Err(AppError::AlreadyExists("Username already taken".to_string()));
        }

        let email_taken: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
            .bind(&email)
            .fetch_optional(db.pool())
            .await?;
        if email_taken.is_some() {
            return Err(AppError::AlreadyExists("Email already registered".to_string()));
        }

        let password_hash = crypto::password_hash(&req.password)?;
        let encryption_key = crypto::generate_user_key();
        let key_salt = crypto::generate_key_salt();

        let user_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO users (id, username, email, password_hash, encryption_key, key_salt, role, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user_id)
        .bind(&req.username)
        .bind(&email)
        .bind(&password_hash)
        .bind(&encryption_key)
        .bind(&key_salt)
        .bind(UserRole::User.as_str())
        .bind(&now)
        .bind(&now)
        .execute(db.pool())
        .await;

        if let Err(e) = result {
            if AppError::is_unique_violation(&e) {
                return Err(AppError::AlreadyExists(
                    "Username or email already registered".to_string(),
                ));
            }
            return Err(e.into());
        }

        let user = Self::get_user(db, &user_id).await?;
        tracing::info!("Registered user {}", user.username);
        let token = Self::generate_token(&user, config)?;
        Ok(AuthResponse {
            user: UserResponse::from(user),
            token,
        })
    }

    /// Login user, driving the account-lock state machine.
    pub async fn login(db: &Database, config: &Config, req: LoginRequest) -> Result<AuthResponse> {
        let email = req.email.trim().to_lowercase();

        let user: User = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(&email)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::AuthFailure("Invalid email or password".to_string()))?;

        if !user.is_active {
            return Err(AppError::Forbidden("Account is disabled".to_string()));
        }

        // Attempts inside the lock window are rejected without advancing
        // the failure counter.
        let lock_expired = match Self::parse_timestamp(user.locked_until.as_deref()) {
            Some(t) if t > Utc::now() => {
                return Err(AppError::AccountLocked(
                    "Account locked due to too many failed login attempts. Try again later."
                        .to_string(),
                ));
            }
            Some(_) => true,
            None => false,
        };

        if !crypto::password_verify(&req.password, &user.password_hash)? {
            Self::record_failed_login(db, &user, lock_expired).await?;
            return Err(AppError::AuthFailure("Invalid email or password".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = 0, locked_until = NULL, last_login = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(&user.id)
        .execute(db.pool())
        .await?;

        let token = Self::generate_token(&user, config)?;
        let user = Self::get_user(db, &user.id).await?;

        Ok(AuthResponse {
            user: UserResponse::from(user),
            token,
        })
    }

    async fn record_failed_login(db: &Database, user: &User, lock_expired: bool) -> Result<()> {
        // A failure after the lock expired restarts the count at 1.
        let attempts = if lock_expired {
            1
        } else {
            user.failed_login_attempts + 1
        };

        let locked_until = if attempts >= MAX_FAILED_LOGINS {
            tracing::warn!("Locking account {} after {} failed logins", user.username, attempts);
            Some((Utc::now() + Duration::hours(LOCK_DURATION_HOURS)).to_rfc3339())
        } else {
            None
        };

        sqlx::query(
            "UPDATE users SET failed_login_attempts = ?, locked_until = ?, updated_at = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(&locked_until)
        .bind(Utc::now().to_rfc3339())
        .bind(&user.id)
        .execute(db.pool())
        .await?;

        Ok(())
    }

    /// Get user by ID
    pub async fn get_user(db: &Database, user_id: &str) -> Result<User> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        Ok(user)
    }

    /// Generate an access token (JWT, HS256)
    pub fn generate_token(user: &User, config: &Config) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            id: user.id.clone(),
            username: user.username.clone(),
            role: user.role.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + config.jwt_expires_in_seconds(),
            iss: TOKEN_ISSUER.to_string(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt.secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// Validate an access token and extract its claims
    pub fn validate_token(token: &str, config: &Config) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.validate_exp = true;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(config.jwt.secret.as_bytes()),
            &validation,
        )
        .map_err(|_| AppError::AuthFailure("Invalid token".to_string()))?;

        Ok(token_data.claims)
    }

    /// Whether a token predates the owner's last password rotation.
    pub fn token_issued_before_rotation(iat: i64, password_changed_at: Option<&str>) -> bool {
        match Self::parse_timestamp(password_changed_at) {
            Some(changed) => iat < changed.timestamp(),
            None => false,
        }
    }

    /// Change user password, invalidating previously issued tokens.
    pub async fn change_password(
        db: &Database,
        user_id: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let user = Self::get_user(db, user_id).await?;

        if !crypto::password_verify(current_password, &user.password_hash)? {
            return Err(AppError::AuthFailure("Current password is incorrect".to_string()));
        }

        Self::validate_password(new_password)?;
        let new_hash = crypto::password_hash(new_password)?;

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE users SET password_hash = ?, password_changed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&new_hash)
        .bind(&now)
        .bind(&now)
        .bind(user_id)
        .execute(db.pool())
        .await?;

        tracing::info!("Password changed for user {}", user.username);
        Ok(())
    }

    fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
        value
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Username: 3-30 chars, alphanumeric and underscore only.
    pub fn validate_username(username: &str) -> Result<()> {
        let len = username.chars().count();
        if !(3..=30).contains(&len) {
            return Err(AppError::Validation(
                "Username must be between 3 and 30 characters".to_string(),
            ));
        }
        if !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(AppError::Validation(
                "Username may only contain letters, digits and underscores".to_string(),
            ));
        }
        Ok(())
    }

    /// Practical email validation. Returns the lowercased address.
    pub fn validate_email(email: &str) -> Result<String> {
        let email = email.trim().to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !email.contains(char::is_whitespace)
                    && !domain.contains("..")
            }
            None => false,
        };
        if !valid {
            return Err(AppError::Validation("Invalid email address".to_string()));
        }
        Ok(email)
    }

    /// Password: at least 8 chars with one lowercase, uppercase, digit, and
    /// special character.
    pub fn validate_password(password: &str) -> Result<()> {
        let long_enough = password.chars().count() >= 8;
        let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        let has_special = password.chars().any(|c| SPECIAL_CHARS.contains(c));

        if !(long_enough && has_lower && has_upper && has_digit && has_special) {
            return Err(AppError::Validation(
                "Password must be at least 8 characters and include lowercase, uppercase, digit and special character (@$!%*?&)"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
