//! API 模块
//!
//! HTTP handlers 和路由组装，所有端点挂在 `/deployer-api` 下

pub mod deploy;
pub mod health;
pub mod session;
pub mod validate;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 路由前缀
pub const API_PREFIX: &str = "/deployer-api";

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // Health
        .merge(health::router())
        // Registry session
        .merge(session::router())
        // Validate
        .merge(validate::router())
        // Deploy
        .merge(deploy::router());

    Router::new()
        .nest(API_PREFIX, api)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
