pub mod auth;
pub mod file;
pub mod share;
pub mod user;

use axum::http::HeaderMap;
use std::net::SocketAddr;

use crate::models::ClientInfo;

/// Client identity for the access log, from the socket address and headers.
pub fn client_info(addr: &SocketAddr, headers: &HeaderMap) -> ClientInfo {
    ClientInfo {
        ip: Some(addr.ip().to_string()),
        user_agent: headers
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string()),
    }
}
