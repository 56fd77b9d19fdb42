//! 会话令牌提取
//!
//! 提供 `SessionCookie` extractor：优先读取 `deployer_session` cookie，
//! 其次读取 `x-session-token` header（非浏览器客户端）

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, header::HeaderMap, request::Parts},
};
use std::convert::Infallible;
use std::time::Duration;

use crate::config::env::constants::{SESSION_COOKIE, SESSION_HEADER};
use crate::domain::session::SessionToken;

/// 会话令牌 Extractor
///
/// 请求里没有令牌时为 `None`，是否放行由 handler 和编排器决定
///
/// # Example
///
/// ```ignore
/// async fn deploy(
///     SessionCookie(token): SessionCookie,
///     State(state): State<Arc<AppState>>,
/// ) -> impl IntoResponse {
///     // handler 逻辑...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct SessionCookie(pub Option<SessionToken>);

#[async_trait]
impl<S> FromRequestParts<S> for SessionCookie
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(SessionCookie(session_token(&parts.headers)))
    }
}

/// 从 cookie 或 header 中读取会话令牌
pub fn session_token(headers: &HeaderMap) -> Option<SessionToken> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| SessionToken::from_raw(value));

    from_cookie.or_else(|| {
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(SessionToken::from_raw)
    })
}

/// 登录成功后下发的 cookie
pub fn session_cookie(token: &SessionToken, max_age: Duration) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE,
        token,
        max_age.as_secs()
    )
}

/// 注销时清除 cookie
pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0", SESSION_COOKIE)
}

/// 审计用的客户端信息
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(client_info(&parts.headers))
    }
}

/// 反向代理后面部署，客户端地址取 `x-forwarded-for` 的第一项
pub fn client_info(headers: &HeaderMap) -> ClientInfo {
    let ip_address = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| header_str(headers, "x-real-ip").map(str::to_string));
    let user_agent = header_str(headers, header::USER_AGENT.as_str()).map(str::to_string);

    ClientInfo {
        ip_address,
        user_agent,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
