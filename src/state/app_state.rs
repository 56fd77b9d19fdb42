//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::env::EnvConfig;
use crate::infra::docker::DockerCli;
use crate::infra::kubectl::KubectlCli;
use crate::infra::monitor::{AuditEvent, MonitorClient};
use crate::services::applier::{ClusterApplier, ClusterClient};
use crate::services::builder::{BuildToolchain, ImageBuilder};
use crate::services::deploy::{Orchestrator, PipelineComponents};
use crate::services::manifest::ManifestDefaults;
use crate::services::publisher::RegistryPublisher;
use crate::services::registry::RegistryClient;
use crate::services::session::SessionManager;
use crate::services::validator::CodeValidator;

use super::log_hub::LogHub;
use super::task_store::TaskStore;

/// 外部工具的实现
///
/// 生产环境是 docker / kubectl CLI，测试中替换为内存实现
pub struct Collaborators {
    pub registry: Arc<dyn RegistryClient>,
    pub toolchain: Arc<dyn BuildToolchain>,
    pub cluster: Arc<dyn ClusterClient>,
}

impl Collaborators {
    /// docker + kubectl
    pub fn from_config(config: &EnvConfig) -> Self {
        let docker = Arc::new(DockerCli::new(&config.registry));
        Self {
            registry: docker.clone(),
            toolchain: docker,
            cluster: Arc::new(KubectlCli::new(&config.cluster)),
        }
    }
}

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 会话与部署 ==========
    /// Registry 会话
    pub sessions: Arc<SessionManager>,
    /// 部署编排器
    pub orchestrator: Arc<Orchestrator>,

    // ========== 任务管理 ==========
    /// 任务存储
    pub task_store: Arc<TaskStore>,
    /// 日志中心
    pub log_hub: Arc<LogHub>,

    // ========== 外部服务 ==========
    /// 审计监控
    pub monitor: MonitorClient,

    /// 关闭时取消，正在运行的工具进程随之终止
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 按环境配置创建（docker / kubectl CLI）
    pub fn new(config: EnvConfig) -> anyhow::Result<Self> {
        let monitor = match config.monitor_url.clone() {
            Some(url) => {
                info!(url = %url, "Audit monitor enabled");
                MonitorClient::new(Some(url))?
            }
            None => MonitorClient::disabled(),
        };
        let collaborators = Collaborators::from_config(&config);
        Ok(Self::with_collaborators(
            config,
            collaborators,
            monitor,
            CancellationToken::new(),
        ))
    }

    /// 使用指定的外部工具实现创建
    pub fn with_collaborators(
        config: EnvConfig,
        collaborators: Collaborators,
        monitor: MonitorClient,
        shutdown: CancellationToken,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            collaborators.registry.clone(),
            config.session_ttl,
        ));
        let task_store = Arc::new(TaskStore::new());
        let log_hub = Arc::new(LogHub::new());

        let components = PipelineComponents {
            validator: CodeValidator::new(),
            builder: ImageBuilder::new(
                collaborators.toolchain,
                collaborators.registry.host(),
                config.build.template.clone(),
                config.build.timeout,
            ),
            publisher: RegistryPublisher::new(collaborators.registry),
            applier: ClusterApplier::new(
                collaborators.cluster,
                config.cluster.rollout_timeout,
                config.cluster.poll_interval,
                config.cluster.node_address.clone(),
            ),
            manifest_defaults: ManifestDefaults {
                default_namespace: config.cluster.default_namespace.clone(),
                max_replicas: config.cluster.max_replicas,
            },
        };
        let orchestrator = Arc::new(Orchestrator::new(
            sessions.clone(),
            components,
            task_store.clone(),
            log_hub.clone(),
            shutdown.clone(),
        ));

        Self {
            config,
            started_at: Utc::now(),
            sessions,
            orchestrator,
            task_store,
            log_hub,
            monitor,
            shutdown,
        }
    }

    /// 上报审计事件（未配置监控时忽略）
    pub fn audit(&self, event: AuditEvent) {
        self.monitor.record(event);
    }

    /// 后台清理：过期会话、过期任务、已完成的日志通道
    pub async fn housekeeping(&self) {
        let expired = self.sessions.cleanup_expired().await;
        self.task_store.cleanup_stale().await;
        self.log_hub.cleanup(30).await;
        if expired > 0 {
            info!(expired, "Purged expired registry sessions");
        }
    }
}
