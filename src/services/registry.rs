//! 镜像仓库访问接口
//!
//! 登录与推送都通过 `RegistryClient` 完成，生产实现是 `infra::docker::DockerCli`，
//! 测试里用 mock 替换

use async_trait::async_trait;
use secrecy::SecretString;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::infra::command::{CommandError, CommandResult};
use crate::state::log_hub::LogSink;

/// Registry 客户端
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Registry 主机名
    fn host(&self) -> &str;

    /// 校验凭据（不在宿主机上持久化凭据）
    async fn login(
        &self,
        username: &str,
        credential: &SecretString,
    ) -> Result<CommandResult, CommandError>;

    /// 用会话凭据推送镜像
    async fn push(
        &self,
        image: &str,
        username: &str,
        credential: &SecretString,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError>;
}

/// Registry 失败分类
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryFailure {
    /// 凭据被拒绝
    Unauthorized,
    /// 网络不通（可重试一次）
    Unreachable,
    /// 配额或限流
    QuotaExceeded,
    /// 其他拒绝
    Other,
}

const QUOTA_MARKERS: &[&str] = &[
    "toomanyrequests",
    "too many requests",
    "rate limit",
    "quota",
];

const UNAUTHORIZED_MARKERS: &[&str] = &[
    "unauthorized",
    "incorrect username or password",
    "authentication required",
    "denied",
    "forbidden",
    "insufficient_scope",
];

const UNREACHABLE_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "no such host",
    "i/o timeout",
    "tls handshake timeout",
    "network is unreachable",
    "context deadline exceeded",
    "cannot connect to the docker daemon",
    "temporary failure in name resolution",
];

/// 根据 docker CLI 输出判断失败类别
pub fn classify_registry_output(output: &str) -> RegistryFailure {
    let lower = output.to_ascii_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(QUOTA_MARKERS) {
        RegistryFailure::QuotaExceeded
    } else if has(UNAUTHORIZED_MARKERS) {
        RegistryFailure::Unauthorized
    } else if has(UNREACHABLE_MARKERS) {
        RegistryFailure::Unreachable
    } else {
        RegistryFailure::Other
    }
}

/// 把一次失败的命令归类
///
/// 超时按网络不通处理
pub fn classify_result(result: &CommandResult) -> RegistryFailure {
    if result.timed_out {
        return RegistryFailure::Unreachable;
    }
    classify_registry_output(&result.combined_text())
}

/// 取输出最后一行非空内容作为错误摘要
pub fn summarize(result: &CommandResult) -> String {
    result
        .lines
        .iter()
        .rev()
        .map(|l| l.content.trim())
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match result.exit_code {
            Some(code) => format!("exited with code {}", code),
            None if result.timed_out => "timed out".to_string(),
            None => "terminated by signal".to_string(),
        })
}

/// 瞬时错误重试前的默认等待
pub fn default_retry_backoff() -> Duration {
    Duration::from_millis(crate::config::env::constants::TRANSIENT_RETRY_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::LogLine;

    #[test]
    fn test_classify_registry_output() {
        assert_eq!(
            classify_registry_output("Error response from daemon: Get \"https://registry-1.docker.io/v2/\": unauthorized: incorrect username or password"),
            RegistryFailure::Unauthorized
        );
        assert_eq!(
            classify_registry_output("denied: requested access to the resource is denied"),
            RegistryFailure::Unauthorized
        );
        assert_eq!(
            classify_registry_output("toomanyrequests: You have reached your pull rate limit"),
            RegistryFailure::QuotaExceeded
        );
        assert_eq!(
            classify_registry_output("dial tcp: lookup registry.example.com: no such host"),
            RegistryFailure::Unreachable
        );
        assert_eq!(
            classify_registry_output("manifest invalid"),
            RegistryFailure::Other
        );
    }

    #[test]
    fn test_timeout_counts_as_unreachable() {
        let result = CommandResult {
            timed_out: true,
            ..Default::default()
        };
        assert_eq!(classify_result(&result), RegistryFailure::Unreachable);
    }

    #[test]
    fn test_summarize_takes_last_line() {
        let result = CommandResult::failed(
            1,
            vec![
                LogLine::stdout("Pushing layer"),
                LogLine::stderr("denied: access forbidden"),
                LogLine::stderr("  "),
            ],
        );
        assert_eq!(summarize(&result), "denied: access forbidden");
        assert_eq!(summarize(&CommandResult::failed(2, vec![])), "exited with code 2");
    }
}
