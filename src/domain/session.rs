//! Registry 会话领域模型

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::fmt;

/// 不透明的会话令牌
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// 生成新的随机令牌
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// 从 cookie / header 中的值恢复令牌
    pub fn from_raw(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value.len() > 128 {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticated,
    Expired,
}

/// Registry 会话
///
/// 凭据只保存在进程内存中，`Debug` 输出不会包含明文
#[derive(Clone, Debug)]
pub struct RegistrySession {
    /// 日志里用来关联的会话 ID（不是令牌本身）
    pub session_id: String,
    pub registry_username: String,
    pub credential: SecretString,
    pub authenticated_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl RegistrySession {
    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }
}
