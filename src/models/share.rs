use serde::{Deserialize, Serialize};

/// Request to create (or replace) a share on a file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareRequest {
    /// Days until expiry; defaults to 7.
    pub expires_in: Option<i64>,
    pub max_downloads: Option<i64>,
    pub password: Option<String>,
}

/// Share creation response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResponse {
    pub share_url: String,
    pub share_token: String,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_downloads: Option<i64>,
    pub has_password: bool,
}

/// Query parameters on the anonymous share download
#[derive(Debug, Deserialize)]
pub struct SharedDownloadQuery {
    pub password: Option<String>,
}
