//! Registry 会话管理
//!
//! 登录成功后生成不透明令牌，凭据只存在内存里。
//! 会话按 TTL 过期，推送被 registry 拒绝时由编排器撤销。

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::session::{RegistrySession, SessionStatus, SessionToken};
use crate::infra::command::CommandError;
use crate::services::registry::{
    classify_result, default_retry_backoff, summarize, RegistryClient, RegistryFailure,
};

/// 登录错误
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing registry username or token")]
    MissingCredentials,
    #[error("Invalid registry credential: {0}")]
    InvalidCredential(String),
    #[error("Registry unreachable: {0}")]
    RegistryUnreachable(String),
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "MissingCredentials",
            Self::InvalidCredential(_) => "InvalidCredential",
            Self::RegistryUnreachable(_) => "RegistryUnreachable",
        }
    }
}

/// 会话管理器
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionToken, RegistrySession>>,
    registry: Arc<dyn RegistryClient>,
    ttl: chrono::Duration,
    retry_backoff: Duration,
}

impl SessionManager {
    pub fn new(registry: Arc<dyn RegistryClient>, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(8)),
            retry_backoff: default_retry_backoff(),
        }
    }

    /// 调整瞬时错误的重试等待
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// 当前 registry 主机
    pub fn registry_host(&self) -> &str {
        self.registry.host()
    }

    /// 校验凭据并建立会话
    ///
    /// 网络不通时重试一次，凭据错误不重试
    pub async fn login(
        &self,
        username: &str,
        credential: SecretString,
    ) -> Result<SessionToken, AuthError> {
        let username = username.trim();
        if username.is_empty() || credential.expose_secret().trim().is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.registry.login(username, &credential).await {
                Ok(result) if result.success => break,
                Ok(result) => {
                    let class = classify_result(&result);
                    let message = summarize(&result);
                    match class {
                        RegistryFailure::Unreachable => AuthError::RegistryUnreachable(message),
                        _ => AuthError::InvalidCredential(message),
                    }
                }
                Err(CommandError::SpawnFailed(e)) => {
                    AuthError::RegistryUnreachable(format!("registry CLI unavailable: {}", e))
                }
                Err(e) => AuthError::RegistryUnreachable(e.to_string()),
            };

            if matches!(failure, AuthError::RegistryUnreachable(_)) && attempt < 2 {
                warn!(
                    registry = %self.registry.host(),
                    error = %failure,
                    "Registry login failed transiently, retrying"
                );
                tokio::time::sleep(self.retry_backoff).await;
                continue;
            }

            warn!(
                registry = %self.registry.host(),
                username = %username,
                kind = failure.kind(),
                "Registry login failed"
            );
            return Err(failure);
        }

        let token = SessionToken::generate();
        let session = RegistrySession {
            session_id: uuid::Uuid::new_v4().to_string(),
            registry_username: username.to_string(),
            credential,
            authenticated_at: Utc::now(),
            status: SessionStatus::Authenticated,
        };
        info!(
            session_id = %session.session_id,
            registry = %self.registry.host(),
            username = %username,
            "Registry session established"
        );

        self.sessions.write().await.insert(token.clone(), session);
        Ok(token)
    }

    /// 注销会话（令牌不存在也视为成功），返回是否真的移除了会话
    pub async fn logout(&self, token: &SessionToken) -> bool {
        let removed = self.sessions.write().await.remove(token);
        if let Some(ref session) = removed {
            info!(session_id = %session.session_id, "Registry session logged out");
        }
        removed.is_some()
    }

    /// 获取会话（过期的会话以 `Expired` 状态返回）
    pub async fn current_session(&self, token: &SessionToken) -> Option<RegistrySession> {
        let sessions = self.sessions.read().await;
        sessions.get(token).map(|session| {
            let mut session = session.clone();
            if self.is_expired(&session) {
                session.status = SessionStatus::Expired;
            }
            session
        })
    }

    /// 会话状态（未知令牌为 `Unauthenticated`）
    pub async fn status(&self, token: Option<&SessionToken>) -> SessionStatus {
        match token {
            Some(token) => self
                .current_session(token)
                .await
                .map_or(SessionStatus::Unauthenticated, |s| s.status),
            None => SessionStatus::Unauthenticated,
        }
    }

    /// 撤销会话（registry 拒绝了会话凭据）
    pub async fn revoke(&self, token: &SessionToken, reason: &str) {
        if let Some(session) = self.sessions.write().await.remove(token) {
            warn!(
                session_id = %session.session_id,
                reason = %reason,
                "Registry session revoked"
            );
        }
    }

    /// 清理过期会话，返回清理数量
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let now = Utc::now();
        let ttl = self.ttl;
        sessions.retain(|_, s| now - s.authenticated_at < ttl);
        before - sessions.len()
    }

    /// 会话总数（含已过期未清理的）
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn is_expired(&self, session: &RegistrySession) -> bool {
        Utc::now() - session.authenticated_at >= self.ttl
    }
}
