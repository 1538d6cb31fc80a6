use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Hard limits enforced server-side.
pub const MAX_FILENAME_CHARS: usize = 255;
pub const MAX_FOLDER_CHARS: usize = 500;
pub const MAX_DESCRIPTION_CHARS: usize = 500;
pub const MAX_TAGS: usize = 20;
pub const MAX_TAG_CHARS: usize = 50;
pub const MAX_BULK_IDS: usize = 100;
/// Access log entries retained per file.
pub const ACCESS_LOG_CAP: i64 = 100;

/// Declared MIME types accepted for upload.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    // Images
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
    // Documents
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    // Archives
    "application/zip",
    "application/x-zip-compressed",
    "application/x-rar-compressed",
    "application/vnd.rar",
    "application/x-7z-compressed",
    "application/x-tar",
    "application/gzip",
    // Video
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "video/x-msvideo",
    "video/webm",
    // Audio
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "audio/webm",
    // Text
    "text/plain",
    "text/csv",
    "text/html",
    "text/css",
    "text/javascript",
    // Structured data
    "application/json",
    "application/xml",
    "text/xml",
    // Fallback
    "application/octet-stream",
];

const ARCHIVE_MIMES: &[&str] = &[
    "application/zip",
    "application/x-zip-compressed",
    "application/x-rar-compressed",
    "application/vnd.rar",
    "application/x-7z-compressed",
    "application/x-tar",
    "application/gzip",
];

const DOCUMENT_MIMES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/json",
    "application/xml",
];

/// Derived file category. Not stored; computed from the declared MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Image,
    Document,
    Video,
    Audio,
    Archive,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Image,
        Category::Document,
        Category::Video,
        Category::Audio,
        Category::Archive,
        Category::Other,
    ];

    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            Category::Image
        } else if mime.starts_with("video/") {
            Category::Video
        } else if mime.starts_with("audio/") {
            Category::Audio
        } else if ARCHIVE_MIMES.contains(&mime.as_str()) {
            Category::Archive
        } else if mime.starts_with("text/") || DOCUMENT_MIMES.contains(&mime.as_str()) {
            Category::Document
        } else {
            Category::Other
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Some(Category::Image),
            "document" => Some(Category::Document),
            "video" => Some(Category::Video),
            "audio" => Some(Category::Audio),
            "archive" => Some(Category::Archive),
            "other" => Some(Category::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Image => "image",
            Category::Document => "document",
            Category::Video => "video",
            Category::Audio => "audio",
            Category::Archive => "archive",
            Category::Other => "other",
        }
    }

    /// SQL LIKE patterns matching this category's MIME family.
    ///
    /// `Other` has no patterns of its own; the query layer negates the
    /// union of all the named families instead.
    pub fn like_patterns(&self) -> Vec<&'static str> {
        match self {
            Category::Image => vec!["image/%"],
            Category::Video => vec!["video/%"],
            Category::Audio => vec!["audio/%"],
            Category::Archive => ARCHIVE_MIMES.to_vec(),
            Category::Document => {
                let mut patterns = vec!["text/%"];
                patterns.extend_from_slice(DOCUMENT_MIMES);
                patterns
            }
            Category::Other => Vec::new(),
        }
    }
}

/// File record
///
/// The share sub-record lives inline: `share_token` present means a share is
/// active (subject to expiry and the download cap).
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    pub id: String,
    pub user_id: String,
    pub original_name: String,
    pub blob_id: String,
    pub mime_type: String,
    pub size: i64,
    pub encrypted_size: i64,
    pub checksum: String,
    pub encrypted_checksum: String,
    pub storage_path: String,
    pub folder: String,
    pub tags: String,
    pub description: String,
    pub download_count: i64,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub share_token: Option<String>,
    pub share_expires_at: Option<String>,
    pub share_max_downloads: Option<i64>,
    pub share_password_hash: Option<String>,
    pub share_download_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl FileRecord {
    pub fn tags_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }

    pub fn category(&self) -> Category {
        Category::from_mime(&self.mime_type)
    }
}

/// Sanitized file response: no storage path, no key material, no access log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub id: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub category: Category,
    pub checksum: String,
    pub folder: String,
    pub tags: Vec<String>,
    pub description: String,
    pub download_count: i64,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    pub is_shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<FileRecord> for FileResponse {
    fn from(file: FileRecord) -> Self {
        let tags = file.tags_vec();
        let category = file.category();
        Self {
            id: file.id,
            original_name: file.original_name,
            mime_type: file.mime_type,
            size: file.size,
            category,
            checksum: file.checksum,
            folder: file.folder,
            tags,
            description: file.description,
            download_count: file.download_count,
            is_deleted: file.is_deleted,
            deleted_at: file.deleted_at,
            is_shared: file.share_token.is_some(),
            share_expires_at: file.share_expires_at,
            created_at: file.created_at,
            updated_at: file.updated_at,
        }
    }
}

/// File list query parameters
#[derive(Debug, Default, Deserialize)]
pub struct ListFilesQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<String>,
    pub category: Option<String>,
    pub folder: Option<String>,
    pub search: Option<String>,
}

/// Pagination envelope
#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        Self {
            page,
            limit,
            total,
            pages: if total == 0 { 0 } else { (total + limit - 1) / limit },
        }
    }
}

/// File list response
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileResponse>,
    pub pagination: Pagination,
}

/// Per-file summary in an upload response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub category: Category,
    pub created_at: String,
}

/// Per-file failure slot in an upload response
#[derive(Debug, Serialize)]
pub struct UploadError {
    pub name: String,
    pub error: String,
}

/// Upload batch response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub files: Vec<UploadedFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<UploadError>,
}

/// Tags arrive either as an array or a comma-separated string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TagsInput {
    List(Vec<String>),
    Csv(String),
}

/// Update file request. Owner, sizes, checksums, blob id, and MIME are
/// immutable.
#[derive(Debug, Deserialize)]
pub struct UpdateFileRequest {
    pub name: Option<String>,
    pub folder: Option<String>,
    pub tags: Option<TagsInput>,
    pub description: Option<String>,
}

/// Bulk delete request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteRequest {
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub permanent: bool,
}

/// Per-id failure slot in a bulk delete response
#[derive(Debug, Serialize)]
pub struct BulkDeleteError {
    pub id: String,
    pub error: String,
}

/// Bulk delete response
#[derive(Debug, Serialize)]
pub struct BulkDeleteResponse {
    pub deleted: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BulkDeleteError>,
}

/// Move files request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveFilesRequest {
    pub file_ids: Vec<String>,
    pub target_folder: String,
}

/// Per-category slice of the stats response
#[derive(Debug, Default, Serialize)]
pub struct CategoryStats {
    pub count: i64,
    pub size: i64,
}

/// Aggregate stats response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_files: i64,
    pub total_size: i64,
    pub categories: std::collections::HashMap<String, CategoryStats>,
    pub recent_uploads: Vec<FileResponse>,
    pub most_downloaded: Vec<FileResponse>,
}

/// Folder listing response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldersResponse {
    pub folders: Vec<String>,
    pub file_counts: std::collections::HashMap<String, i64>,
}

/// Access log action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    View,
    Download,
    Share,
    Update,
    Delete,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessAction::View => "view",
            AccessAction::Download => "download",
            AccessAction::Share => "share",
            AccessAction::Update => "update",
            AccessAction::Delete => "delete",
        }
    }
}

/// Request-scoped client identity recorded in the access log.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Replace path separators and shell-hostile characters, then cap length.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_FILENAME_CHARS)
        .collect();

    if cleaned.trim().is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Root a folder path at `/` and enforce the length cap.
pub fn normalize_folder(folder: &str) -> crate::error::Result<String> {
    let trimmed = folder.trim();
    let rooted = if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };

    if rooted.chars().count() > MAX_FOLDER_CHARS {
        return Err(crate::error::AppError::Validation(format!(
            "Folder path must be at most {} characters",
            MAX_FOLDER_CHARS
        )));
    }
    Ok(rooted)
}

/// Normalize tags from either input shape: trim, drop empties, truncate each
/// tag to its cap, keep at most the first twenty.
pub fn normalize_tags(input: &TagsInput) -> Vec<String> {
    let raw: Vec<String> = match input {
        TagsInput::List(list) => list.clone(),
        TagsInput::Csv(csv) => csv.split(',').map(|s| s.to_string()).collect(),
    };

    raw.into_iter()
        .map(|t| t.trim().chars().take(MAX_TAG_CHARS).collect::<String>())
        .filter(|t| !t.is_empty())
        .take(MAX_TAGS)
        .collect()
}

/// Truncate a description to its cap.
pub fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_from_mime_families() {
        assert_eq!(Category::from_mime("image/png"), Category::Image);
        assert_eq!(Category::from_mime("IMAGE/JPEG"), Category::Image);
        assert_eq!(Category::from_mime("video/mp4"), Category::Video);
        assert_eq!(Category::from_mime("audio/ogg"), Category::Audio);
        assert_eq!(Category::from_mime("application/zip"), Category::Archive);
        assert_eq!(Category::from_mime("application/gzip"), Category::Archive);
        assert_eq!(Category::from_mime("application/pdf"), Category::Document);
        assert_eq!(Category::from_mime("text/plain"), Category::Document);
        assert_eq!(Category::from_mime("application/json"), Category::Document);
        assert_eq!(
            Category::from_mime("application/octet-stream"),
            Category::Other
        );
    }

    #[test]
    fn sanitize_replaces_hostile_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a<b>c:d\"e|f?g*h.txt"), "a_b_c_d_e_f_g_h.txt");
        assert_eq!(sanitize_filename("win\\path.doc"), "win_path.doc");
        assert_eq!(sanitize_filename("  "), "unnamed");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(300);
        assert_eq!(sanitize_filename(&long).chars().count(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn folder_is_rooted() {
        assert_eq!(normalize_folder("docs").unwrap(), "/docs");
        assert_eq!(normalize_folder("/docs/work").unwrap(), "/docs/work");
        assert_eq!(normalize_folder("").unwrap(), "/");
        assert!(normalize_folder(&"x".repeat(501)).is_err());
    }

    #[test]
    fn tags_normalize_from_both_shapes() {
        let csv = TagsInput::Csv("alpha, beta ,, gamma".to_string());
        assert_eq!(normalize_tags(&csv), vec!["alpha", "beta", "gamma"]);

        let list = TagsInput::List(vec!["  one  ".to_string(), String::new()]);
        assert_eq!(normalize_tags(&list), vec!["one"]);
    }

    #[test]
    fn tags_are_capped() {
        let many: Vec<String> = (0..30).map(|i| format!("tag{}", i)).collect();
        assert_eq!(normalize_tags(&TagsInput::List(many)).len(), MAX_TAGS);

        let long = TagsInput::List(vec!["x".repeat(80)]);
        assert_eq!(normalize_tags(&long)[0].chars().count(), MAX_TAG_CHARS);
    }

    #[test]
    fn pagination_page_count() {
        assert_eq!(Pagination::new(1, 20, 0).pages, 0);
        assert_eq!(Pagination::new(1, 20, 20).pages, 1);
        assert_eq!(Pagination::new(1, 20, 21).pages, 2);
        assert_eq!(Pagination::new(1, 20, 100).pages, 5);
    }
}
