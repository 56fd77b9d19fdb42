//! 健康检查 API
//!
//! GET /health

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    registry: String,
    default_namespace: String,
    active_deploys: usize,
    sessions: usize,
    audit_enabled: bool,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

/// 健康检查
///
/// GET /health
/// 无需认证
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "xjp-app-deployer",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        registry: state.sessions.registry_host().to_string(),
        default_namespace: state.config.cluster.default_namespace.clone(),
        active_deploys: state.task_store.active_count().await,
        sessions: state.sessions.count().await,
        audit_enabled: state.monitor.is_enabled(),
    })
}
