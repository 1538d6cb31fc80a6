use axum::{
    body::Body,
    extract::{ConnectInfo, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use std::net::SocketAddr;

use crate::error::{ApiResponse, AppError, Result};
use crate::handlers::client_info;
use crate::models::{
    BulkDeleteRequest, BulkDeleteResponse, CurrentUser, FileListResponse, FileRecord,
    FileResponse, FoldersResponse, ListFilesQuery, MoveFilesRequest, StatsResponse, TagsInput,
    UpdateFileRequest, UploadResponse,
};
use crate::services::file::UploadItem;
use crate::services::FileService;
use crate::AppState;

/// Upload a batch of files
/// POST /api/files/upload (multipart, field `files`)
pub async fn upload(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let mut items: Vec<UploadItem> = Vec::new();
    let mut folder: Option<String> = None;
    let mut tags: Option<TagsInput> = None;
    let mut description: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Failed to process multipart: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "files" => {
                let file_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| AppError::Validation("File field has no filename".to_string()))?;
                let mime_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("Failed to read file data: {}", e)))?;

                items.push(UploadItem {
                    name: file_name,
                    mime_type,
                    data,
                });
            }
            "folder" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    folder = Some(text);
                }
            }
            "tags" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    // Accepts a JSON array or a comma-separated string.
                    tags = Some(
                        serde_json::from_str::<Vec<String>>(&text)
                            .map(TagsInput::List)
                            .unwrap_or(TagsInput::Csv(text)),
                    );
                }
            }
            "description" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    description = Some(text);
                }
            }
            _ => {}
        }
    }

    let response: UploadResponse = FileService::upload_batch(
        &state.db,
        state.store.as_ref(),
        &state.config,
        &current_user.id,
        folder,
        tags,
        description,
        items,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// List files
/// GET /api/files?page&limit&sort&category&folder&search
pub async fn list(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<ApiResponse<FileListResponse>>> {
    let files = FileService::list(&state.db, &current_user.id, &query, false).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// List trash
/// GET /api/files/trash
pub async fn list_trash(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<ApiResponse<FileListResponse>>> {
    let files = FileService::list(&state.db, &current_user.id, &query, true).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Get a single file
/// GET /api/files/:id
pub async fn get(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let client = client_info(&addr, &headers);
    let file = FileService::get(&state.db, &current_user.id, &id, &client).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// Update file metadata
/// PATCH /api/files/:id
pub async fn update(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateFileRequest>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let client = client_info(&addr, &headers);
    let file = FileService::update(&state.db, &current_user.id, &id, req, &client).await?;
    Ok(Json(ApiResponse::success(file)))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub permanent: bool,
}

/// Delete a file (soft by default, permanent with `?permanent=true`)
/// DELETE /api/files/:id
pub async fn delete(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<ApiResponse<()>>> {
    if query.permanent {
        FileService::permanent_delete(&state.db, state.store.as_ref(), &current_user.id, &id)
            .await?;
        Ok(Json(ApiResponse::<()>::success_message(
            "File permanently deleted",
        )))
    } else {
        let client = client_info(&addr, &headers);
        FileService::soft_delete(&state.db, &current_user.id, &id, &client).await?;
        Ok(Json(ApiResponse::<()>::success_message("File moved to trash")))
    }
}

/// Download a file
/// GET /api/files/:id/download
pub async fn download(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response> {
    let client = client_info(&addr, &headers);
    let (record, data) =
        FileService::download(&state.db, state.store.as_ref(), &current_user.id, &id, &client)
            .await?;

    attachment_response(&record, data)
}

/// Inline image preview
/// GET /api/files/:id/preview
pub async fn preview(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response> {
    let client = client_info(&addr, &headers);
    let (record, data) =
        FileService::preview(&state.db, state.store.as_ref(), &current_user.id, &id, &client)
            .await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, record.mime_type.as_str())
        .header(header::CONTENT_LENGTH, data.len())
        .header(header::CONTENT_DISPOSITION, "inline")
        .header(header::CACHE_CONTROL, "private, max-age=3600")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}

/// Restore a file from trash
/// POST /api/files/:id/restore
pub async fn restore(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let file = FileService::restore(&state.db, &current_user.id, &id).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// Empty the trash
/// DELETE /api/files/trash
pub async fn empty_trash(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<BulkDeleteResponse>>> {
    let response =
        FileService::empty_trash(&state.db, state.store.as_ref(), &current_user.id).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Bulk delete
/// POST /api/files/bulk-delete
pub async fn bulk_delete(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<BulkDeleteRequest>,
) -> Result<Json<ApiResponse<BulkDeleteResponse>>> {
    let client = client_info(&addr, &headers);
    let response =
        FileService::bulk_delete(&state.db, state.store.as_ref(), &current_user.id, req, &client)
            .await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Move files into a folder
/// POST /api/files/move
pub async fn move_files(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<MoveFilesRequest>,
) -> Result<Json<ApiResponse<()>>> {
    let moved = FileService::move_files(&state.db, &current_user.id, req).await?;
    Ok(Json(ApiResponse::<()>::success_message(&format!(
        "Moved {} files",
        moved
    ))))
}

/// Folder listing
/// GET /api/files/folders
pub async fn folders(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<FoldersResponse>>> {
    let response = FileService::folders(&state.db, &current_user.id).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Aggregate stats
/// GET /api/files/stats
pub async fn stats(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<StatsResponse>>> {
    let response = FileService::stats(&state.db, &current_user.id).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Attachment response with the stored MIME and the original filename.
pub(crate) fn attachment_response(record: &FileRecord, data: Vec<u8>) -> Result<Response> {
    let encoded_name = urlencoding::encode(&record.original_name).into_owned();

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, record.mime_type.as_str())
        .header(header::CONTENT_LENGTH, data.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", encoded_name),
        )
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}
