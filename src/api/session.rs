//! Registry 会话 API
//!
//! 包含 /docker-login, /docker-logout, /session 端点

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::config::env::constants::SESSION_HEADER;
use crate::domain::session::SessionStatus;
use crate::infra::monitor::AuditEvent;
use crate::middleware::session::{clear_session_cookie, session_cookie};
use crate::middleware::{ClientInfo, SessionCookie};
use crate::services::session::AuthError;
use crate::state::AppState;

/// 登录请求
#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub docker_user: String,
    #[serde(default)]
    pub docker_token: String,
}

/// 登录 / 注销响应
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

/// 会话状态响应
#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub status: SessionStatus,
    pub registry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// 创建会话路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/docker-login", post(docker_login))
        .route("/docker-logout", post(docker_logout))
        .route("/session", get(session_status))
}

/// 登录 registry
///
/// POST /docker-login
/// 成功后通过 cookie 和 `x-session-token` header 下发令牌
async fn docker_login(
    State(state): State<Arc<AppState>>,
    SessionCookie(previous): SessionCookie,
    client: ClientInfo,
    Json(request): Json<LoginRequest>,
) -> Response {
    let username = request.docker_user.trim().to_string();
    let audit = AuditEvent::new(
        "/deployer-api/docker-login",
        "docker-login",
        if username.is_empty() { "anonymous" } else { username.as_str() },
    )
    .request(json!({
        "docker_user": username,
        "docker_token": request.docker_token,
    }))
    .client(client.ip_address, client.user_agent);

    let credential = SecretString::from(request.docker_token);
    match state.sessions.login(&username, credential).await {
        Ok(token) => {
            // 同一浏览器重新登录时替换旧会话
            if let Some(previous) = previous {
                state.sessions.logout(&previous).await;
            }
            state.audit(audit.response(json!({"success": true})));

            let body = SessionResponse {
                success: true,
                message: Some(format!(
                    "Logged in to {} as {}",
                    state.sessions.registry_host(),
                    username
                )),
                error: None,
                error_kind: None,
            };
            let mut response = Json(body).into_response();
            let headers = response.headers_mut();
            if let Ok(cookie) = HeaderValue::from_str(&session_cookie(&token, state.config.session_ttl)) {
                headers.insert(header::SET_COOKIE, cookie);
            }
            if let Ok(value) = HeaderValue::from_str(token.as_str()) {
                headers.insert(SESSION_HEADER, value);
            }
            response
        }
        Err(e) => {
            let status = match e {
                AuthError::MissingCredentials | AuthError::InvalidCredential(_) => {
                    StatusCode::BAD_REQUEST
                }
                AuthError::RegistryUnreachable(_) => StatusCode::BAD_GATEWAY,
            };
            let error: String = e.to_string().chars().take(500).collect();
            state.audit(audit.response(json!({"success": false, "error": error})));

            let body = SessionResponse {
                success: false,
                message: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
            };
            (status, Json(body)).into_response()
        }
    }
}

/// 注销
///
/// POST /docker-logout
/// 总是成功，同时清除 cookie
async fn docker_logout(
    State(state): State<Arc<AppState>>,
    SessionCookie(token): SessionCookie,
    client: ClientInfo,
) -> Response {
    let mut user = "anonymous".to_string();
    if let Some(ref token) = token {
        if let Some(session) = state.sessions.current_session(token).await {
            user = session.registry_username;
        }
        state.sessions.logout(token).await;
    }

    state.audit(
        AuditEvent::new("/deployer-api/docker-logout", "docker-logout", user)
            .request(json!({}))
            .response(json!({"success": true}))
            .client(client.ip_address, client.user_agent),
    );

    let body = SessionResponse {
        success: true,
        message: None,
        error: None,
        error_kind: None,
    };
    let mut response = Json(body).into_response();
    if let Ok(cookie) = HeaderValue::from_str(&clear_session_cookie()) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

/// 当前会话状态
///
/// GET /session
async fn session_status(
    State(state): State<Arc<AppState>>,
    SessionCookie(token): SessionCookie,
) -> impl IntoResponse {
    let session = match token {
        Some(ref token) => state.sessions.current_session(token).await,
        None => None,
    };

    Json(SessionStatusResponse {
        status: session
            .as_ref()
            .map_or(SessionStatus::Unauthenticated, |s| s.status),
        registry: state.sessions.registry_host().to_string(),
        username: session.map(|s| s.registry_username),
    })
}
