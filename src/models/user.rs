use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }
}

/// User model
///
/// `encryption_key` and `key_salt` are storage-private key material; the
/// password hash is an Argon2 digest. None of these leave the server.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub encryption_key: String,
    pub key_salt: String,
    pub role: String,
    pub is_active: bool,
    pub storage_used: i64,
    pub storage_limit: i64,
    pub failed_login_attempts: i64,
    pub locked_until: Option<String>,
    pub last_login: Option<String>,
    pub password_changed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// User response (without key material or password verifier)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: String,
    pub storage_used: i64,
    pub storage_limit: i64,
    pub is_active: bool,
    pub last_login: Option<String>,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            role: user.role,
            storage_used: user.storage_used,
            storage_limit: user.storage_limit,
            is_active: user.is_active,
            last_login: user.last_login,
            created_at: user.created_at,
        }
    }
}

/// Registration request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

/// Login request
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Registration/login response: the user plus a bearer token
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub token: String,
}

/// Update profile request
#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub username: Option<String>,
    pub email: Option<String>,
}

/// Change password request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Storage usage response
#[derive(Debug, Serialize)]
pub struct StorageUsageResponse {
    pub used: i64,
    pub limit: i64,
    pub percentage: u8,
}

/// Current authenticated user (extracted from JWT)
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub username: String,
    pub role: UserRole,
}

/// JWT Claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub username: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}
