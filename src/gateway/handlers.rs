//! Route handlers with fixed payloads

use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// `GET /health` payload
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests
    pub status: &'static str,
    /// Current time, ISO 8601 with milliseconds
    pub time: String,
}

/// `GET /api/user-info` payload
#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    /// Client name
    pub user: &'static str,
    /// Granted permissions
    pub permissions: Vec<&'static str>,
    /// Roles
    pub roles: Vec<&'static str>,
}

/// Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Caller profile (protected)
pub async fn user_info() -> Json<UserInfoResponse> {
    Json(UserInfoResponse {
        user: "client123",
        permissions: vec!["read", "write"],
        roles: vec!["user"],
    })
}
