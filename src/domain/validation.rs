//! 源码校验结果

use serde::Serialize;
use std::fmt;

/// 拒绝原因类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RejectionReason {
    InvalidAppName,
    SyntaxError,
    PolicyViolation,
    /// 副本数 / 端口 / namespace 超出范围（仅 deploy 时检查）
    InvalidParameter,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidAppName => "InvalidAppName",
            Self::SyntaxError => "SyntaxError",
            Self::PolicyViolation => "PolicyViolation",
            Self::InvalidParameter => "InvalidParameter",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次拒绝：类别 + 可读诊断
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub detail: String,
}

impl Rejection {
    pub fn new(reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

/// 校验结果（派生值，不持久化）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub app_name_normalized: Option<String>,
    /// 仅在 is_valid == false 时存在
    pub rejection: Option<Rejection>,
}

impl ValidationResult {
    pub fn valid(app_name: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            app_name_normalized: Some(app_name.into()),
            rejection: None,
        }
    }

    pub fn invalid(rejection: Rejection) -> Self {
        Self {
            is_valid: false,
            app_name_normalized: None,
            rejection: Some(rejection),
        }
    }

    pub fn reason(&self) -> Option<RejectionReason> {
        self.rejection.as_ref().map(|r| r.reason)
    }
}
