use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::daemon::resources::UsageLevel;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub data_dir: String,
    pub usage_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Reports the disk level as the overall status. An unreadable job root is
/// reported as critical with 503.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let data_dir = state
        .config
        .data_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let (code, status, usage_pct, message) = match state.resources.usage_report().await {
        Ok(report) => {
            let status = match state.resources.classify(report.usage_pct) {
                UsageLevel::Ok => "ok",
                UsageLevel::Warning => "warning",
                UsageLevel::Critical => "critical",
            };
            (StatusCode::OK, status, Some(report.usage_pct), None)
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "critical",
            None,
            Some(format!("{:#}", e)),
        ),
    };

    let response = HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir,
        usage_pct,
        message,
    };

    (code, Json(response))
}
