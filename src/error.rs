use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type
///
/// Known/operational variants carry a user-visible message emitted verbatim.
/// Corruption and crypto failures never leak detail to the client.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AuthFailure(String),

    #[error("{0}")]
    AccountLocked(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    ShareExpired(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("{0}")]
    MissingBlob(String),

    #[error("File integrity check failed")]
    IntegrityFailure,

    #[error("Encryption operation failed")]
    CryptoFailure,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a database error is a unique-index violation.
    ///
    /// Concurrent writers can both pass a pre-check and one loses at commit;
    /// the loser is translated to `AlreadyExists` at the call site.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => db_err.message().contains("UNIQUE constraint failed"),
            _ => false,
        }
    }
}

/// API response wrapper
///
/// Every response body has this shape; `requiresPassword` only appears in
/// the share password handshake.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(rename = "requiresPassword", skip_serializing_if = "Option::is_none")]
    pub requires_password: Option<bool>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            requires_password: None,
        }
    }

    pub fn success_message(message: &str) -> ApiResponse<()> {
        ApiResponse {
            success: true,
            message: Some(message.to_string()),
            data: None,
            requires_password: None,
        }
    }

    pub fn error(message: &str) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            message: Some(message.to_string()),
            data: None,
            requires_password: None,
        }
    }

    pub fn password_required() -> ApiResponse<()> {
        ApiResponse {
            success: false,
            message: Some("Password required".to_string()),
            data: None,
            requires_password: Some(true),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::AuthFailure(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::AccountLocked(msg) => (StatusCode::LOCKED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::AlreadyExists(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::QuotaExceeded(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ShareExpired(msg) => (StatusCode::GONE, msg.clone()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests, please try again later".to_string(),
            ),
            AppError::MissingBlob(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::IntegrityFailure => {
                tracing::error!("Integrity failure surfaced to client");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "File integrity check failed".to_string(),
                )
            }
            AppError::CryptoFailure => {
                tracing::error!("Crypto failure surfaced to client");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Jwt(e) => {
                tracing::warn!("JWT error: {:?}", e);
                (StatusCode::UNAUTHORIZED, "Invalid token".to_string())
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ApiResponse::<()>::error(&message));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
