//! 部署编排
//!
//! 会话校验 → 代码校验 → 构建 → 推送 → 渲染 → 提交，
//! 任一步失败立即返回，已产生的部分结果附在 `DeployResult` 中。

pub mod context;

use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::artifact::ApplyOutcome;
use crate::domain::deploy::{
    join_lines, DeployErrorKind, DeployFailure, DeployRequest, DeployResult, DeployTask,
};
use crate::domain::session::{RegistrySession, SessionToken};
use crate::domain::validation::{Rejection, RejectionReason};
use crate::services::applier::{ApplyError, ClusterApplier};
use crate::services::builder::{BuildError, BuildSpec, ImageBuilder};
use crate::services::manifest::{self, ManifestDefaults, ManifestError};
use crate::services::publisher::{PushError, RegistryPublisher};
use crate::services::session::SessionManager;
use crate::services::validator::CodeValidator;
use crate::state::log_hub::LogSink;
use crate::state::task_store::CapacityExceeded;
use crate::state::{LogHub, TaskStore};

pub use context::{DeployContext, PipelineStage};

/// 部署错误
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("not logged into the registry")]
    Unauthenticated,
    #[error("validation failed: {0}")]
    ValidationFailed(Rejection),
    #[error("build failed: {0}")]
    BuildFailed(BuildError),
    #[error("push failed: {0}")]
    PushFailed(PushError),
    #[error("manifest rendering failed: {0}")]
    RenderFailed(ManifestError),
    #[error("apply failed: {0}")]
    ApplyFailed(ApplyError),
}

impl DeployError {
    pub fn kind(&self) -> DeployErrorKind {
        match self {
            Self::Unauthenticated => DeployErrorKind::Unauthenticated,
            Self::ValidationFailed(_) => DeployErrorKind::ValidationFailed,
            Self::BuildFailed(_) => DeployErrorKind::BuildFailed,
            Self::PushFailed(_) => DeployErrorKind::PushFailed,
            Self::RenderFailed(_) => DeployErrorKind::RenderFailed,
            Self::ApplyFailed(_) => DeployErrorKind::ApplyFailed,
        }
    }

    /// 子类别
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Unauthenticated | Self::RenderFailed(_) => None,
            Self::ValidationFailed(r) => Some(r.reason.as_str().to_string()),
            Self::BuildFailed(e) => Some(e.kind().to_string()),
            Self::PushFailed(e) => Some(e.kind().to_string()),
            Self::ApplyFailed(e) => Some(e.kind().to_string()),
        }
    }

    pub fn to_failure(&self) -> DeployFailure {
        DeployFailure {
            kind: self.kind(),
            reason: self.reason(),
            message: self.to_string(),
        }
    }
}

/// 编排器依赖的各个组件
pub struct PipelineComponents {
    pub validator: CodeValidator,
    pub builder: ImageBuilder,
    pub publisher: RegistryPublisher,
    pub applier: ClusterApplier,
    pub manifest_defaults: ManifestDefaults,
}

/// 后台部署句柄
///
/// 丢弃句柄不会中止部署，结果仍会写入任务存储
pub struct DeployHandle {
    pub task_id: String,
    handle: JoinHandle<DeployResult>,
}

impl DeployHandle {
    pub async fn wait(self) -> Result<DeployResult, JoinError> {
        self.handle.await
    }
}

/// 失败时仍需返回的部分结果
#[derive(Default)]
struct PipelineState {
    build_id: Option<String>,
    image_reference: Option<String>,
    manifest_text: Option<String>,
    logs: Vec<String>,
}

/// 部署编排器
pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    validator: CodeValidator,
    builder: ImageBuilder,
    publisher: RegistryPublisher,
    applier: ClusterApplier,
    manifest_defaults: ManifestDefaults,
    task_store: Arc<TaskStore>,
    log_hub: Arc<LogHub>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        components: PipelineComponents,
        task_store: Arc<TaskStore>,
        log_hub: Arc<LogHub>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            validator: components.validator,
            builder: components.builder,
            publisher: components.publisher,
            applier: components.applier,
            manifest_defaults: components.manifest_defaults,
            task_store,
            log_hub,
            shutdown,
        }
    }

    /// 校验器（/validate 与部署使用同一份规则）
    pub fn validator(&self) -> &CodeValidator {
        &self.validator
    }

    /// 执行部署并等待结果
    pub async fn deploy(
        &self,
        token: Option<&SessionToken>,
        request: DeployRequest,
    ) -> Result<DeployResult, CapacityExceeded> {
        let (task_id, sink) = self.register(&request).await?;
        Ok(self.execute(task_id, sink, token.cloned(), request).await)
    }

    /// 在后台任务中执行部署
    ///
    /// 活跃任务已满时直接拒绝，不登记任务
    pub async fn submit(
        self: &Arc<Self>,
        token: Option<SessionToken>,
        request: DeployRequest,
    ) -> Result<DeployHandle, CapacityExceeded> {
        let (task_id, sink) = self.register(&request).await?;
        let this = Arc::clone(self);
        let id = task_id.clone();
        let handle = tokio::spawn(async move { this.execute(id, sink, token, request).await });
        Ok(DeployHandle { task_id, handle })
    }

    async fn register(&self, request: &DeployRequest) -> Result<(String, LogSink), CapacityExceeded> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let namespace = request
            .namespace_or(&self.manifest_defaults.default_namespace)
            .to_string();
        self.task_store
            .create(DeployTask::new(
                task_id.clone(),
                request.app_name.trim().to_string(),
                namespace,
            ))
            .await
            .inspect_err(|e| warn!(app_name = %request.app_name.trim(), error = %e, "Deployment rejected"))?;
        let sink = self.log_hub.create(&task_id).await;
        Ok((task_id, sink))
    }

    async fn execute(
        &self,
        task_id: String,
        sink: LogSink,
        token: Option<SessionToken>,
        request: DeployRequest,
    ) -> DeployResult {
        let namespace = request
            .namespace_or(&self.manifest_defaults.default_namespace)
            .to_string();
        let mut ctx = DeployContext::new(
            task_id.clone(),
            request.app_name.trim().to_string(),
            namespace,
            sink,
            self.shutdown.child_token(),
            self.task_store.clone(),
        );

        info!(
            task_id = %ctx.task_id,
            app_name = %ctx.app_name,
            namespace = %ctx.namespace,
            kind = request.workload_kind.as_str(),
            replicas = request.replica_count,
            "Deployment started"
        );

        let mut state = PipelineState::default();
        let outcome = self
            .run_pipeline(&mut ctx, token.as_ref(), &request, &mut state)
            .await;

        let result = match outcome {
            Ok(outcome) => {
                state.logs.push(join_lines(&outcome.apply_logs));
                ctx.log_summary();
                info!(
                    task_id = %ctx.task_id,
                    app_name = %ctx.app_name,
                    image = %outcome.image,
                    "Deployment finished"
                );
                DeployResult {
                    success: true,
                    task_id: task_id.clone(),
                    build_id: state.build_id,
                    image_reference: Some(outcome.image),
                    manifest_text: Some(outcome.manifest_text),
                    logs: state.logs,
                    apply_logs: outcome.apply_logs,
                    service_url_hint: outcome.service_url_hint,
                    applied_resources: outcome.applied_resources,
                    stages: ctx.stages(),
                    error: None,
                }
            }
            Err(err) => {
                ctx.fail(&err.to_string()).await;
                ctx.log_summary();
                warn!(
                    task_id = %ctx.task_id,
                    app_name = %ctx.app_name,
                    kind = err.kind().as_str(),
                    error = %err,
                    "Deployment failed"
                );

                let (apply_logs, applied_resources) = match err {
                    DeployError::ApplyFailed(ref e) => {
                        (e.logs().to_vec(), e.applied_resources().to_vec())
                    }
                    _ => (Vec::new(), Vec::new()),
                };
                let failed_log = match err {
                    DeployError::BuildFailed(ref e) => Some(e.log()),
                    DeployError::PushFailed(ref e) => Some(e.log()),
                    DeployError::ApplyFailed(ref e) => Some(e.logs()),
                    _ => None,
                };
                if let Some(lines) = failed_log {
                    state.logs.push(join_lines(lines));
                }

                DeployResult {
                    success: false,
                    task_id: task_id.clone(),
                    build_id: state.build_id,
                    image_reference: state.image_reference,
                    manifest_text: state.manifest_text,
                    logs: state.logs,
                    apply_logs,
                    service_url_hint: None,
                    applied_resources,
                    stages: ctx.stages(),
                    error: Some(err.to_failure()),
                }
            }
        };

        self.task_store.finish(&task_id, result.clone()).await;
        self.log_hub.finish(&task_id).await;
        result
    }

    async fn run_pipeline(
        &self,
        ctx: &mut DeployContext,
        token: Option<&SessionToken>,
        request: &DeployRequest,
        state: &mut PipelineState,
    ) -> Result<ApplyOutcome, DeployError> {
        let session = self.require_session(token).await?;

        // 1. 校验（与 /validate 相同的规则 + 部署参数）
        ctx.start(PipelineStage::Validate).await;
        let validation = self
            .validator
            .validate(&request.app_name, &request.source_code);
        if let Some(rejection) = validation.rejection {
            return Err(DeployError::ValidationFailed(rejection));
        }
        let container_port = self
            .check_parameters(request)
            .map_err(DeployError::ValidationFailed)?;
        let app_name = validation
            .app_name_normalized
            .unwrap_or_else(|| request.app_name.trim().to_string());
        ctx.succeed(PipelineStage::Validate, None).await;

        // 2. 构建
        ctx.start(PipelineStage::Build).await;
        let spec = BuildSpec {
            app_name: &app_name,
            source_code: &request.source_code,
            registry_username: &session.registry_username,
            container_port,
        };
        let artifact = self
            .builder
            .build(&spec, Some(&ctx.log_tx), &ctx.cancel_token)
            .await
            .map_err(DeployError::BuildFailed)?;
        state.build_id = Some(artifact.build_id.clone());
        state.image_reference = Some(artifact.image_reference.clone());
        state.logs.push(join_lines(&artifact.build_log));
        ctx.succeed(PipelineStage::Build, Some(artifact.build_id.clone()))
            .await;

        // 3. 推送（构建期间会话可能已注销或过期）
        ctx.start(PipelineStage::Push).await;
        let session = self.require_session(token).await?;
        match self
            .publisher
            .push(&session, &artifact, Some(&ctx.log_tx), &ctx.cancel_token)
            .await
        {
            Ok(log) => state.logs.push(join_lines(&log)),
            Err(e) => {
                if e.is_unauthorized() {
                    if let Some(token) = token {
                        self.sessions
                            .revoke(token, "registry rejected credential during push")
                            .await;
                    }
                }
                return Err(DeployError::PushFailed(e));
            }
        }
        ctx.succeed(PipelineStage::Push, None).await;

        // 4. 渲染清单
        ctx.start(PipelineStage::Render).await;
        let manifest = manifest::render(request, &artifact.image_reference, &self.manifest_defaults)
            .map_err(DeployError::RenderFailed)?;
        state.manifest_text = Some(manifest.rendered_text.clone());
        ctx.succeed(PipelineStage::Render, None).await;

        // 5. 提交到集群
        ctx.start(PipelineStage::Apply).await;
        let outcome = self
            .applier
            .apply(
                &manifest,
                &artifact.image_reference,
                Some(&ctx.log_tx),
                &ctx.cancel_token,
            )
            .await
            .map_err(DeployError::ApplyFailed)?;
        ctx.succeed(PipelineStage::Apply, outcome.service_url_hint.clone())
            .await;

        Ok(outcome)
    }

    async fn require_session(
        &self,
        token: Option<&SessionToken>,
    ) -> Result<RegistrySession, DeployError> {
        let token = token.ok_or(DeployError::Unauthenticated)?;
        match self.sessions.current_session(token).await {
            Some(session) if session.is_authenticated() => Ok(session),
            _ => Err(DeployError::Unauthenticated),
        }
    }

    /// 校验部署参数，返回容器端口
    fn check_parameters(&self, request: &DeployRequest) -> Result<u16, Rejection> {
        let max = self.manifest_defaults.max_replicas;
        if request.replica_count < 1 || request.replica_count > max {
            return Err(Rejection::new(
                RejectionReason::InvalidParameter,
                format!("replicas must be between 1 and {}", max),
            ));
        }

        let port = u16::try_from(request.container_port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                Rejection::new(
                    RejectionReason::InvalidParameter,
                    "container_port must be between 1 and 65535",
                )
            })?;

        if let Some(ns) = request.target_namespace.as_deref().map(str::trim) {
            if !ns.is_empty() && !is_valid_namespace(ns) {
                return Err(Rejection::new(
                    RejectionReason::InvalidParameter,
                    format!("'{}' is not a valid namespace name", ns),
                ));
            }
        }

        Ok(port)
    }
}

/// namespace 名称：DNS label（小写字母数字和 '-'，最长 63）
fn is_valid_namespace(ns: &str) -> bool {
    let bytes = ns.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes.iter().all(|b| alnum(b) || *b == b'-')
        && bytes.first().is_some_and(alnum)
        && bytes.last().is_some_and(alnum)
}
