//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 部署任务状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Running,
    Success,
    Failed,
}

impl DeployStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Running => "running",
            DeployStatus::Success => "success",
            DeployStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployStatus::Success | DeployStatus::Failed)
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "validate", "build", "push")
    pub name: String,
    /// 显示名称 (e.g., "Validate Source", "Image Build")
    pub display_name: String,
    /// 开始时间
    pub started_at: Option<DateTime<Utc>>,
    /// 结束时间
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    /// 阶段状态
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 部署任务信息
#[derive(Clone, Debug, Serialize)]
pub struct DeployTask {
    pub id: String,
    pub app_name: String,
    pub namespace: String,
    pub status: DeployStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 部署阶段详情
    #[serde(default)]
    pub stages: Vec<DeployStage>,
    /// 终态结果（任务结束后写入）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DeployResult>,
}

impl DeployTask {
    /// 创建新任务
    pub fn new(id: String, app_name: String, namespace: String) -> Self {
        Self {
            id,
            app_name,
            namespace,
            status: DeployStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::new(),
            result: None,
        }
    }
}

/// 日志行
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    /// 创建新日志行
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    /// 创建 stdout 日志行
    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    /// 创建 stderr 日志行
    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}

/// 把日志行拼成一段文本（响应里的 logs 字段按阶段分块）
pub fn join_lines(lines: &[LogLine]) -> String {
    lines
        .iter()
        .map(|l| l.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// 工作负载类型
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    /// 解析请求中的 k8s_kind（大小写不敏感）
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "deployment" => Some(Self::Deployment),
            "statefulset" => Some(Self::StatefulSet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
        }
    }

    /// kubectl 资源名（用于 `kubectl get <resource>/<name>`）
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
        }
    }
}

/// 服务暴露方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceExposure {
    None,
    ClusterIP,
    #[default]
    NodePort,
    LoadBalancer,
}

impl ServiceExposure {
    /// 解析请求中的 service_type
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "clusterip" => Some(Self::ClusterIP),
            "" | "nodeport" => Some(Self::NodePort),
            "loadbalancer" => Some(Self::LoadBalancer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClusterIP => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
        }
    }

    /// 是否需要生成 Service 资源
    pub fn creates_service(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// 部署请求（接受后不可变）
#[derive(Clone, Debug)]
pub struct DeployRequest {
    pub app_name: String,
    pub source_code: String,
    pub workload_kind: WorkloadKind,
    pub replica_count: u32,
    pub service_exposure: ServiceExposure,
    pub container_port: u32,
    /// 为空时使用配置的默认 namespace
    pub target_namespace: Option<String>,
}

impl DeployRequest {
    /// 解析最终使用的 namespace
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.target_namespace
            .as_deref()
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default)
    }
}

/// 部署失败类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployErrorKind {
    Unauthenticated,
    ValidationFailed,
    BuildFailed,
    PushFailed,
    RenderFailed,
    ApplyFailed,
}

impl DeployErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::ValidationFailed => "ValidationFailed",
            Self::BuildFailed => "BuildFailed",
            Self::PushFailed => "PushFailed",
            Self::RenderFailed => "RenderFailed",
            Self::ApplyFailed => "ApplyFailed",
        }
    }
}

/// 失败详情
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeployFailure {
    pub kind: DeployErrorKind,
    /// 子类别（如 PushFailed 下的 Unauthorized）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

/// 部署终态结果
///
/// 每个请求恰好产生一个，构造后不再修改
#[derive(Clone, Debug, Default, Serialize)]
pub struct DeployResult {
    pub success: bool,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_text: Option<String>,
    /// 按阶段分块的日志（build / push / apply）
    pub logs: Vec<String>,
    pub apply_logs: Vec<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url_hint: Option<String>,
    /// 已提交到集群的资源（失败时供调用方排查或清理）
    pub applied_resources: Vec<String>,
    pub stages: Vec<DeployStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeployFailure>,
}

impl DeployResult {
    pub fn error_kind(&self) -> Option<DeployErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
