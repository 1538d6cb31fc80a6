use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::net::SocketAddr;

use crate::error::{ApiResponse, Result};
use crate::handlers::{client_info, file::attachment_response};
use crate::models::{CreateShareRequest, CurrentUser, ShareResponse, SharedDownloadQuery};
use crate::services::share::ShareConsume;
use crate::services::ShareService;
use crate::AppState;

/// Create (or replace) a share on a file
/// POST /api/files/:id/share
pub async fn create_share(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<CreateShareRequest>,
) -> Result<Json<ApiResponse<ShareResponse>>> {
    let client = client_info(&addr, &headers);
    let share = ShareService::create_share(
        &state.db,
        &state.config,
        &current_user.id,
        &id,
        req,
        &client,
    )
    .await?;
    Ok(Json(ApiResponse::success(share)))
}

/// Revoke a share
/// DELETE /api/files/:id/share
pub async fn revoke_share(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    ShareService::revoke_share(&state.db, &current_user.id, &id).await?;
    Ok(Json(ApiResponse::<()>::success_message("Share revoked")))
}

/// Anonymous share download
/// GET /api/files/shared/:token?password=
///
/// A password-protected share answered without a password gets a 401 with
/// `requiresPassword: true` rather than an error: the client is expected to
/// retry with credentials.
pub async fn shared_download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Query(query): Query<SharedDownloadQuery>,
) -> Result<Response> {
    let client = client_info(&addr, &headers);
    let outcome = ShareService::consume(
        &state.db,
        state.store.as_ref(),
        &token,
        query.password,
        &client,
    )
    .await?;

    match outcome {
        ShareConsume::PasswordRequired => Ok((
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::<()>::password_required()),
        )
            .into_response()),
        ShareConsume::Payload { record, data } => attachment_response(&record, data),
    }
}
