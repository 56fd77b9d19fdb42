//! 审计监控 HTTP Client
//!
//! 登录、注销、校验、部署等操作上报到监控服务。
//! 上报失败不影响请求本身，敏感字段一律替换为 `****`。

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// 需要脱敏的字段
const SENSITIVE_KEYS: &[&str] = &["access_key", "secret_key", "docker_token", "password", "token"];

/// 上报超时
const MONITOR_TIMEOUT: Duration = Duration::from_secs(1);

/// 审计事件
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub user_id: String,
    pub service: &'static str,
    pub endpoint: String,
    pub action_type: String,
    pub request_data: Value,
    pub response_summary: Value,
    pub ip_address: String,
    pub user_agent: String,
}

impl AuditEvent {
    pub fn new(endpoint: &str, action_type: &str, user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            service: "Deployer",
            endpoint: endpoint.to_string(),
            action_type: action_type.to_string(),
            request_data: Value::Null,
            response_summary: Value::Null,
            ip_address: String::new(),
            user_agent: String::new(),
        }
    }

    /// 设置请求数据（自动脱敏）
    pub fn request(mut self, mut data: Value) -> Self {
        mask_sensitive(&mut data);
        self.request_data = data;
        self
    }

    pub fn response(mut self, summary: Value) -> Self {
        self.response_summary = summary;
        self
    }

    pub fn client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address.unwrap_or_default();
        self.user_agent = user_agent.unwrap_or_default();
        self
    }
}

/// 把敏感字段替换为 `****`（递归处理嵌套对象）
pub fn mask_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    *field = Value::String("****".to_string());
                } else {
                    mask_sensitive(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_sensitive),
        _ => {}
    }
}

/// 审计监控客户端
#[derive(Clone)]
pub struct MonitorClient {
    client: Client,
    url: Option<String>,
}

impl MonitorClient {
    pub fn new(url: Option<String>) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(MONITOR_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()?;
        Ok(Self { client, url })
    }

    /// 未配置地址的客户端
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            url: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// 异步上报，不等待结果
    pub fn record(&self, event: AuditEvent) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    debug!(status = %resp.status(), action = %event.action_type, "Monitor rejected audit event");
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, action = %event.action_type, "Failed to send audit event");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mask_sensitive() {
        let mut data = json!({
            "docker_user": "alice",
            "docker_token": "dckr_pat_123",
            "nested": {"password": "hunter2", "keep": "yes"},
            "list": [{"secret_key": "s"}]
        });
        mask_sensitive(&mut data);

        assert_eq!(data["docker_user"], "alice");
        assert_eq!(data["docker_token"], "****");
        assert_eq!(data["nested"]["password"], "****");
        assert_eq!(data["nested"]["keep"], "yes");
        assert_eq!(data["list"][0]["secret_key"], "****");
    }

    #[test]
    fn test_event_builder_masks_request() {
        let event = AuditEvent::new("/deployer-api/docker-login", "docker-login", "alice")
            .request(json!({"docker_user": "alice", "docker_token": "secret"}))
            .response(json!({"success": true}));

        let body = serde_json::to_string(&event).unwrap();
        assert!(!body.contains("secret\""));
        assert!(body.contains("\"service\":\"Deployer\""));
    }

    #[tokio::test]
    async fn test_disabled_client_is_noop() {
        let monitor = MonitorClient::disabled();
        assert!(!monitor.is_enabled());
        monitor.record(AuditEvent::new("/x", "x", "anonymous"));
    }
}
