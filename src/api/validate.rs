//! 源码校验 API
//!
//! POST /validate，规则与部署前的校验完全一致

use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::domain::validation::RejectionReason;
use crate::infra::monitor::AuditEvent;
use crate::middleware::{ClientInfo, SessionCookie};
use crate::state::AppState;

/// 未提供 app_name 时使用的名称
pub(crate) fn default_app_name() -> String {
    "flaskapp".to_string()
}

/// 校验请求
#[derive(Deserialize)]
pub struct ValidateRequest {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub code: String,
}

/// 校验响应
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub success: bool,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/validate", post(validate))
}

/// 校验源码
///
/// POST /validate
/// 无需登录；校验失败同样返回 200，`valid = false`
async fn validate(
    State(state): State<Arc<AppState>>,
    SessionCookie(token): SessionCookie,
    client: ClientInfo,
    Json(request): Json<ValidateRequest>,
) -> impl IntoResponse {
    let result = state
        .orchestrator
        .validator()
        .validate(&request.app_name, &request.code);

    let user = match token {
        Some(ref token) => state
            .sessions
            .current_session(token)
            .await
            .map(|s| s.registry_username),
        None => None,
    };
    state.audit(
        AuditEvent::new(
            "/deployer-api/validate",
            "validate-code",
            user.unwrap_or_else(|| "anonymous".to_string()),
        )
        .request(json!({"app_name": request.app_name}))
        .response(json!({
            "valid": result.is_valid,
            "reason": result.reason().map(|r| r.as_str()),
        }))
        .client(client.ip_address, client.user_agent),
    );

    let (reason, detail) = match result.rejection {
        Some(rejection) => (Some(rejection.reason), Some(rejection.detail)),
        None => (None, None),
    };
    Json(ValidateResponse {
        success: result.is_valid,
        valid: result.is_valid,
        app_name: result.app_name_normalized,
        reason,
        detail,
    })
}
