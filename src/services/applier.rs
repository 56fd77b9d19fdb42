//! 集群提交
//!
//! 声明式 apply 清单后轮询工作负载状态，直到就绪、超时或出现不可恢复的错误。
//! 失败不会自动回滚，已提交的资源随错误一起返回。

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::artifact::ApplyOutcome;
use crate::domain::deploy::LogLine;
use crate::domain::manifest::Manifest;
use crate::infra::command::{CommandError, CommandResult};
use crate::services::registry::{default_retry_backoff, summarize};
use crate::state::log_hub::LogSink;

/// 集群客户端
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// 声明式提交清单（`kubectl apply -f -`）
    async fn apply(
        &self,
        manifest: &str,
        namespace: &str,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError>;

    /// 读取资源 JSON（`kubectl get <resource> -o json`）
    async fn get_json(
        &self,
        resource: &str,
        namespace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError>;
}

/// 提交错误
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("cluster rejected the manifest: {reason}")]
    RejectedByClusterApi {
        reason: String,
        logs: Vec<LogLine>,
        applied_resources: Vec<String>,
    },
    #[error("rollout not ready after {timeout:?}")]
    RolloutTimeout {
        timeout: Duration,
        partial_logs: Vec<LogLine>,
        applied_resources: Vec<String>,
    },
    #[error("cluster API unreachable: {reason}")]
    Unreachable {
        reason: String,
        logs: Vec<LogLine>,
        applied_resources: Vec<String>,
    },
}

impl ApplyError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RejectedByClusterApi { .. } => "RejectedByClusterAPI",
            Self::RolloutTimeout { .. } => "RolloutTimeout",
            Self::Unreachable { .. } => "Unreachable",
        }
    }

    pub fn logs(&self) -> &[LogLine] {
        match self {
            Self::RejectedByClusterApi { logs, .. } | Self::Unreachable { logs, .. } => logs,
            Self::RolloutTimeout { partial_logs, .. } => partial_logs,
        }
    }

    pub fn applied_resources(&self) -> &[String] {
        match self {
            Self::RejectedByClusterApi {
                applied_resources, ..
            }
            | Self::RolloutTimeout {
                applied_resources, ..
            }
            | Self::Unreachable {
                applied_resources, ..
            } => applied_resources,
        }
    }
}

/// 工作负载 rollout 状态
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutState {
    Ready,
    Progressing(String),
    Failed(String),
}

const UNREACHABLE_MARKERS: &[&str] = &[
    "unable to connect to the server",
    "connection refused",
    "no such host",
    "i/o timeout",
    "tls handshake timeout",
    "context deadline exceeded",
    "the server is currently unable to handle the request",
];

/// kubectl 输出是否表示 API Server 不可达
pub fn is_unreachable_output(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// 从 `kubectl apply` 输出解析已提交的资源
///
/// 输出形如 `deployment.apps/hello created`，返回 `deployment/hello`
pub fn parse_applied_resources(lines: &[LogLine]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.stream == "stdout")
        .filter_map(|l| {
            let mut parts = l.content.split_whitespace();
            let resource = parts.next()?;
            let verb = parts.next()?;
            if !matches!(verb, "created" | "configured" | "unchanged") {
                return None;
            }
            let (kind, name) = resource.split_once('/')?;
            let kind = kind.split('.').next().unwrap_or(kind);
            Some(format!("{}/{}", kind, name))
        })
        .collect()
}

/// 根据工作负载 JSON 判断 rollout 状态
pub fn rollout_state(workload: &Value) -> RolloutState {
    let status = &workload["status"];

    if let Some(conditions) = status["conditions"].as_array() {
        for condition in conditions {
            let kind = condition["type"].as_str().unwrap_or_default();
            let cond_status = condition["status"].as_str().unwrap_or_default();
            let reason = condition["reason"].as_str().unwrap_or_default();
            let message = condition["message"].as_str().unwrap_or(reason);

            if kind == "Progressing" && cond_status == "False" && reason == "ProgressDeadlineExceeded" {
                return RolloutState::Failed(message.to_string());
            }
            if kind == "ReplicaFailure" && cond_status == "True" {
                return RolloutState::Failed(message.to_string());
            }
        }
    }

    let generation = workload["metadata"]["generation"].as_u64().unwrap_or(0);
    let observed = status["observedGeneration"].as_u64().unwrap_or(0);
    if observed < generation {
        return RolloutState::Progressing("waiting for controller to observe the new spec".to_string());
    }

    let desired = workload["spec"]["replicas"].as_u64().unwrap_or(1);
    let count = |field: &str| status[field].as_u64().unwrap_or(0);
    let updated = count("updatedReplicas");

    if workload["kind"].as_str() == Some("StatefulSet") {
        let ready = count("readyReplicas");
        if ready < desired {
            return RolloutState::Progressing(format!("{}/{} replicas ready", ready, desired));
        }
        if let Some(revision) = status["updateRevision"].as_str() {
            if status["currentRevision"].as_str() != Some(revision) {
                return RolloutState::Progressing(format!(
                    "{}/{} replicas at revision {}",
                    updated, desired, revision
                ));
            }
        }
        return RolloutState::Ready;
    }

    // 旧 ReplicaSet 的 Pod 也计入 readyReplicas，只能看 updated / total / available
    let total = count("replicas");
    let available = count("availableReplicas");
    if updated < desired {
        RolloutState::Progressing(format!("{}/{} replicas updated", updated, desired))
    } else if total > updated {
        RolloutState::Progressing(format!(
            "{} old replicas pending termination",
            total - updated
        ))
    } else if available < updated {
        RolloutState::Progressing(format!(
            "{}/{} updated replicas available",
            available, updated
        ))
    } else {
        RolloutState::Ready
    }
}

/// 从节点列表中挑一个可访问的地址（优先 ExternalIP）
pub fn node_address(nodes: &Value) -> Option<String> {
    let addresses = nodes["items"].as_array()?.iter().flat_map(|node| {
        node["status"]["addresses"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    });
    let addresses: Vec<Value> = addresses.collect();

    ["ExternalIP", "InternalIP"].iter().find_map(|wanted| {
        addresses
            .iter()
            .find(|a| a["type"].as_str() == Some(*wanted))
            .and_then(|a| a["address"].as_str())
            .map(str::to_string)
    })
}

/// 根据 Service 生成访问地址提示
pub fn service_url_hint(service: &Value, node_address: Option<&str>) -> Option<String> {
    let spec = &service["spec"];
    let port = &spec["ports"][0];
    let cluster_ip = spec["clusterIP"].as_str().filter(|ip| !ip.is_empty() && *ip != "None");

    let (host, port) = match spec["type"].as_str()? {
        "NodePort" => (node_address?.to_string(), port["nodePort"].as_u64()?),
        "LoadBalancer" => {
            let ingress = &service["status"]["loadBalancer"]["ingress"][0];
            let host = ingress["ip"]
                .as_str()
                .or_else(|| ingress["hostname"].as_str())
                .or(cluster_ip)?;
            (host.to_string(), port["port"].as_u64()?)
        }
        "ClusterIP" => (cluster_ip?.to_string(), port["port"].as_u64()?),
        _ => return None,
    };
    Some(format!("http://{}:{}/", host, port))
}

/// 集群提交器
pub struct ClusterApplier {
    client: Arc<dyn ClusterClient>,
    rollout_timeout: Duration,
    poll_interval: Duration,
    node_address: Option<String>,
    retry_backoff: Duration,
}

impl ClusterApplier {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        rollout_timeout: Duration,
        poll_interval: Duration,
        node_address: Option<String>,
    ) -> Self {
        Self {
            client,
            rollout_timeout,
            poll_interval,
            node_address,
            retry_backoff: default_retry_backoff(),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// 提交清单并等待工作负载就绪
    pub async fn apply(
        &self,
        manifest: &Manifest,
        image: &str,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mut logs = Vec::new();
        let applied_resources = self.submit(manifest, log_tx, cancel, &mut logs).await?;

        info!(
            namespace = %manifest.namespace,
            workload = %manifest.workload_name,
            resources = ?applied_resources,
            "Manifest applied, waiting for rollout"
        );

        if let Err(state) = self.wait_ready(manifest, log_tx, cancel, &mut logs).await {
            return Err(match state {
                WaitFailure::Failed(reason) => ApplyError::RejectedByClusterApi {
                    reason,
                    logs,
                    applied_resources,
                },
                WaitFailure::TimedOut => ApplyError::RolloutTimeout {
                    timeout: self.rollout_timeout,
                    partial_logs: logs,
                    applied_resources,
                },
            });
        }

        let service_url_hint = match manifest.service_name {
            Some(ref svc) => Some(
                self.url_hint(svc, &manifest.namespace, cancel)
                    .await
                    .unwrap_or_else(|| {
                        format!("(check: kubectl get svc {} -n {})", svc, manifest.namespace)
                    }),
            ),
            None => None,
        };

        Ok(ApplyOutcome {
            image: image.to_string(),
            manifest_text: manifest.rendered_text.clone(),
            apply_logs: logs,
            service_url_hint,
            applied_resources,
        })
    }

    /// 执行 apply，网络不可达时重试一次
    async fn submit(
        &self,
        manifest: &Manifest,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
        logs: &mut Vec<LogLine>,
    ) -> Result<Vec<String>, ApplyError> {
        let mut applied_resources: Vec<String> = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .apply(&manifest.rendered_text, &manifest.namespace, log_tx, cancel)
                .await;

            let (unreachable, reason) = match result {
                Ok(result) => {
                    // 超时或断连前可能已经提交了一部分
                    for resource in parse_applied_resources(&result.lines) {
                        if !applied_resources.contains(&resource) {
                            applied_resources.push(resource);
                        }
                    }
                    let unreachable = result.timed_out || is_unreachable_output(&result.combined_text());
                    let success = result.success;
                    let reason = summarize(&result);
                    logs.extend(result.lines);
                    if success {
                        return Ok(applied_resources);
                    }
                    if !unreachable {
                        return Err(ApplyError::RejectedByClusterApi {
                            reason,
                            logs: std::mem::take(logs),
                            applied_resources,
                        });
                    }
                    (true, reason)
                }
                Err(CommandError::Cancelled) => (false, "apply cancelled".to_string()),
                Err(e) => (true, e.to_string()),
            };

            if unreachable && attempt < 2 {
                warn!(namespace = %manifest.namespace, error = %reason, "Cluster unreachable, retrying apply");
                tokio::time::sleep(self.retry_backoff).await;
                continue;
            }

            logs.push(LogLine::stderr(reason.clone()));
            return Err(ApplyError::Unreachable {
                reason,
                logs: std::mem::take(logs),
                applied_resources,
            });
        }
    }

    /// 轮询工作负载直到就绪
    async fn wait_ready(
        &self,
        manifest: &Manifest,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
        logs: &mut Vec<LogLine>,
    ) -> Result<(), WaitFailure> {
        let resource = format!("{}/{}", manifest.kind.resource(), manifest.workload_name);
        let deadline = Instant::now() + self.rollout_timeout;
        let mut last_message = String::new();

        loop {
            match self
                .client
                .get_json(&resource, Some(&manifest.namespace), cancel)
                .await
            {
                Ok(result) if result.success => {
                    match serde_json::from_str::<Value>(&result.stdout_text()) {
                        Ok(workload) => match rollout_state(&workload) {
                            RolloutState::Ready => {
                                record(logs, log_tx, LogLine::stdout(format!("{} is ready", resource)));
                                return Ok(());
                            }
                            RolloutState::Failed(reason) => {
                                record(logs, log_tx, LogLine::stderr(format!("{} failed: {}", resource, reason)));
                                return Err(WaitFailure::Failed(reason));
                            }
                            RolloutState::Progressing(message) => {
                                if message != last_message {
                                    record(logs, log_tx, LogLine::stdout(format!("{}: {}", resource, message)));
                                    last_message = message;
                                }
                            }
                        },
                        Err(e) => warn!(resource = %resource, error = %e, "Unparseable workload status"),
                    }
                }
                Ok(result) => {
                    warn!(resource = %resource, error = %summarize(&result), "Failed to read workload status");
                }
                Err(CommandError::Cancelled) => {
                    record(logs, log_tx, LogLine::stderr("rollout watch cancelled"));
                    return Err(WaitFailure::TimedOut);
                }
                Err(e) => warn!(resource = %resource, error = %e, "Failed to read workload status"),
            }

            let now = Instant::now();
            if now >= deadline {
                record(
                    logs,
                    log_tx,
                    LogLine::stderr(format!("{} not ready after {:?}", resource, self.rollout_timeout)),
                );
                return Err(WaitFailure::TimedOut);
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    record(logs, log_tx, LogLine::stderr("rollout watch cancelled"));
                    return Err(WaitFailure::TimedOut);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn url_hint(
        &self,
        service: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let result = self
            .client
            .get_json(&format!("service/{}", service), Some(namespace), cancel)
            .await
            .ok()
            .filter(|r| r.success)?;
        let service_json: Value = serde_json::from_str(&result.stdout_text()).ok()?;

        let node = match (&self.node_address, service_json["spec"]["type"].as_str()) {
            (Some(addr), _) => Some(addr.clone()),
            (None, Some("NodePort")) => self.lookup_node_address(cancel).await,
            _ => None,
        };
        service_url_hint(&service_json, node.as_deref())
    }

    async fn lookup_node_address(&self, cancel: &CancellationToken) -> Option<String> {
        let result = self
            .client
            .get_json("nodes", None, cancel)
            .await
            .ok()
            .filter(|r| r.success)?;
        let nodes: Value = serde_json::from_str(&result.stdout_text()).ok()?;
        node_address(&nodes)
    }
}

enum WaitFailure {
    Failed(String),
    TimedOut,
}

/// 记录一行日志并转发到实时通道
fn record(logs: &mut Vec<LogLine>, log_tx: Option<&LogSink>, line: LogLine) {
    if let Some(tx) = log_tx {
        tx.send(line.clone());
    }
    logs.push(line);
}
