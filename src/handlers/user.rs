use axum::{extract::State, Extension, Json};
use serde::Deserialize;

use crate::error::{ApiResponse, Result};
use crate::models::{
    CurrentUser, StorageUsageResponse, UpdatePasswordRequest, UpdateProfileRequest, UserResponse,
};
use crate::services::{AuthService, UserService};
use crate::AppState;

/// Current user profile
/// GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<UserResponse>>> {
    let profile = UserService::get_profile(&state.db, &current_user.id).await?;
    Ok(Json(ApiResponse::success(profile)))
}

/// Update username and/or email
/// PATCH /api/auth/update-profile
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<ApiResponse<UserResponse>>> {
    let profile = UserService::update_profile(&state.db, &current_user.id, req).await?;
    Ok(Json(ApiResponse::success(profile)))
}

/// Change password; previously issued tokens stop working
/// PATCH /api/auth/update-password
pub async fn update_password(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<UpdatePasswordRequest>,
) -> Result<Json<ApiResponse<()>>> {
    AuthService::change_password(
        &state.db,
        &current_user.id,
        &req.current_password,
        &req.new_password,
    )
    .await?;
    Ok(Json(ApiResponse::<()>::success_message(
        "Password updated. Please log in again.",
    )))
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    pub password: String,
}

/// Deactivate the account
/// DELETE /api/auth/delete-account
pub async fn delete_account(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<DeleteAccountRequest>,
) -> Result<Json<ApiResponse<()>>> {
    UserService::deactivate_account(&state.db, &current_user.id, &req.password).await?;
    Ok(Json(ApiResponse::<()>::success_message("Account deactivated")))
}

/// Storage usage
/// GET /api/auth/storage
pub async fn storage(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<StorageUsageResponse>>> {
    let usage = UserService::get_storage_usage(&state.db, &current_user.id).await?;
    Ok(Json(ApiResponse::success(usage)))
}
