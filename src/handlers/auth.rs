use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::error::{ApiResponse, Result};
use crate::models::{AuthResponse, LoginRequest, RegisterRequest};
use crate::services::AuthService;
use crate::AppState;

/// Register a new user
/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let response = AuthService::register(&state.db, &state.config, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(response)),
    ))
}

/// Login
/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiResponse<AuthResponse>>> {
    let response = AuthService::login(&state.db, &state.config, req).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Logout
/// POST /api/auth/logout
///
/// Tokens are stateless bearer JWTs; the client discards its copy. A
/// password change is the server-side revocation path.
pub async fn logout() -> Json<ApiResponse<()>> {
    Json(ApiResponse::<()>::success_message("Logged out"))
}
