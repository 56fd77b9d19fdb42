//! 部署 API
//!
//! 包含 /deploy, /deploys/*, /deploys/:task_id/logs/stream 端点

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::api::validate::default_app_name;
use crate::domain::deploy::{
    DeployErrorKind, DeployRequest, DeployResult, DeployStage, DeployTask, LogLine,
    ServiceExposure, WorkloadKind,
};
use crate::domain::session::SessionToken;
use crate::error::{ApiError, ApiResult};
use crate::infra::monitor::AuditEvent;
use crate::middleware::{ClientInfo, SessionCookie};
use crate::state::AppState;

/// SSE 检查任务是否结束的间隔
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 部署请求体
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default = "default_kind")]
    pub k8s_kind: String,
    #[serde(default = "default_replicas")]
    pub replicas: i64,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_container_port")]
    pub container_port: i64,
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_kind() -> String {
    "Deployment".to_string()
}

fn default_replicas() -> i64 {
    2
}

fn default_service_type() -> String {
    "NodePort".to_string()
}

fn default_container_port() -> i64 {
    5000
}

impl DeployBody {
    /// 转换为领域请求
    ///
    /// 未知的 kind / service_type 直接拒绝；数值越界留给编排器的参数校验
    pub fn into_request(self) -> ApiResult<DeployRequest> {
        let workload_kind = WorkloadKind::parse(&self.k8s_kind).ok_or_else(|| {
            ApiError::bad_request(format!(
                "Unsupported k8s_kind '{}', expected Deployment or StatefulSet",
                self.k8s_kind
            ))
        })?;
        let service_exposure = ServiceExposure::parse(&self.service_type).ok_or_else(|| {
            ApiError::bad_request(format!(
                "Unsupported service_type '{}', expected none, ClusterIP, NodePort or LoadBalancer",
                self.service_type
            ))
        })?;

        Ok(DeployRequest {
            app_name: self.app_name,
            source_code: self.code,
            workload_kind,
            replica_count: u32::try_from(self.replicas).unwrap_or(0),
            service_exposure,
            container_port: u32::try_from(self.container_port).unwrap_or(0),
            target_namespace: self.namespace,
        })
    }
}

/// 部署选项
#[derive(Debug, Deserialize)]
pub struct DeployQuery {
    /// 立即返回 task_id，部署在后台继续
    #[serde(default)]
    pub detach: bool,
}

/// 部署响应
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub success: bool,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub apply_logs: Vec<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url_hint: Option<String>,
    pub applied_resources: Vec<String>,
    pub stages: Vec<DeployStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<DeployErrorKind>,
    /// 子类别（如 PushFailed 下的 Unauthorized）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<DeployResult> for DeployResponse {
    fn from(result: DeployResult) -> Self {
        let (error, error_kind, reason) = match result.error {
            Some(failure) => (Some(failure.message), Some(failure.kind), failure.reason),
            None => (None, None, None),
        };
        Self {
            success: result.success,
            task_id: result.task_id,
            build_id: result.build_id,
            image: result.image_reference,
            manifest: result.manifest_text,
            logs: result.logs,
            apply_logs: result.apply_logs,
            service_url_hint: result.service_url_hint,
            applied_resources: result.applied_resources,
            stages: result.stages,
            error,
            error_kind,
            reason,
        }
    }
}

/// 后台部署响应
#[derive(Debug, Serialize)]
pub struct DetachedResponse {
    pub task_id: String,
    pub status: String,
    pub stream_url: String,
}

/// 任务历史查询参数
#[derive(Debug, Deserialize)]
pub struct TaskHistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 应用名称过滤
    pub app_name: Option<String>,
    /// 状态过滤 (success, failed, running)
    pub status: Option<String>,
}

fn default_limit() -> usize {
    20
}

/// 任务历史响应
#[derive(Debug, Serialize)]
pub struct TaskHistoryResponse {
    pub tasks: Vec<DeployTask>,
    pub total: usize,
}

/// 创建部署路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/deploys/recent", get(get_recent_deploys))
        .route("/deploys/:task_id", get(get_deploy))
        .route("/deploys/:task_id/logs/stream", get(stream_logs))
}

/// 部署结果对应的 HTTP 状态
fn result_status(result: &DeployResult) -> StatusCode {
    match result.error_kind() {
        Some(DeployErrorKind::Unauthenticated) => StatusCode::UNAUTHORIZED,
        Some(DeployErrorKind::ValidationFailed) => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    }
}

/// 部署
///
/// POST /deploy[?detach=true]
/// 需要已登录 registry。部署在后台任务中执行，客户端断开不会中止部署
async fn deploy(
    State(state): State<Arc<AppState>>,
    SessionCookie(token): SessionCookie,
    client: ClientInfo,
    Query(query): Query<DeployQuery>,
    Json(body): Json<DeployBody>,
) -> ApiResult<Response> {
    let request = body.into_request()?;

    let user = current_user(&state, token.as_ref()).await;
    let audit = AuditEvent::new("/deployer-api/deploy", "deploy-app", user)
        .request(json!({
            "app_name": request.app_name,
            "namespace": request.target_namespace,
            "replicas": request.replica_count,
            "k8s_kind": request.workload_kind.as_str(),
            "service_type": request.service_exposure.as_str(),
        }))
        .client(client.ip_address, client.user_agent);

    let handle = state
        .orchestrator
        .submit(token, request)
        .await
        .map_err(|e| ApiError::too_many_requests(e.to_string()))?;
    let task_id = handle.task_id.clone();

    if query.detach {
        let state = state.clone();
        tokio::spawn(async move {
            if let Ok(result) = handle.wait().await {
                state.audit(audit.response(audit_summary(&result)));
            }
        });
        let body = DetachedResponse {
            stream_url: format!("/deployer-api/deploys/{}/logs/stream", task_id),
            task_id,
            status: "running".to_string(),
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let result = handle.wait().await.map_err(|e| {
        error!(task_id = %task_id, error = %e, "Deployment task aborted");
        ApiError::internal(format!("Deployment task '{}' aborted", task_id))
    })?;
    state.audit(audit.response(audit_summary(&result)));

    let status = result_status(&result);
    Ok((status, Json(DeployResponse::from(result))).into_response())
}

async fn current_user(state: &AppState, token: Option<&SessionToken>) -> String {
    match token {
        Some(token) => state
            .sessions
            .current_session(token)
            .await
            .map(|s| s.registry_username)
            .unwrap_or_else(|| "anonymous".to_string()),
        None => "anonymous".to_string(),
    }
}

fn audit_summary(result: &DeployResult) -> serde_json::Value {
    let hint: Option<String> = result
        .service_url_hint
        .as_ref()
        .map(|h| h.chars().take(500).collect());
    json!({
        "success": result.success,
        "task_id": result.task_id,
        "image": result.image_reference,
        "service_url_hint": hint,
        "error_kind": result.error_kind().map(|k| k.as_str()),
    })
}

/// 获取部署任务
///
/// GET /deploys/:task_id
/// 同时查询活跃任务和历史记录，已完成的任务附带完整结果
async fn get_deploy(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .task_store
        .get_any(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Task '{}'", task_id)))?;

    Ok(Json(task))
}

/// 获取最近的部署
///
/// GET /deploys/recent
async fn get_recent_deploys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskHistoryQuery>,
) -> impl IntoResponse {
    let app_name = query.app_name.as_deref();
    let status = query.status.as_deref();

    // 运行中的任务在前，历史在后
    let mut tasks: Vec<DeployTask> = state
        .task_store
        .get_all()
        .await
        .into_iter()
        .filter(|task| !task.status.is_terminal())
        .filter(|task| app_name.map_or(true, |a| task.app_name == a))
        .filter(|task| status.map_or(true, |s| task.status.as_str() == s))
        .collect();
    tasks.extend(
        state
            .task_store
            .get_history(query.limit, app_name, status)
            .await,
    );
    tasks.truncate(query.limit);

    let total = tasks.len();
    Json(TaskHistoryResponse { tasks, total })
}

fn log_event(line: &LogLine) -> Event {
    let json = serde_json::to_string(line).unwrap_or_default();
    Event::default().event("log").data(json)
}

/// 流式日志
///
/// GET /deploys/:task_id/logs/stream
/// 先回放已有输出，再推送实时日志，任务结束后发送 `complete` 事件
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if state.task_store.get_any(&task_id).await.is_none() {
        return Err(ApiError::not_found(format!("Task '{}'", task_id)));
    }
    let sink = state.log_hub.get(&task_id).await;

    let stream = async_stream::stream! {
        if let Some(sink) = sink {
            let (backlog, mut rx) = sink.subscribe_with_backlog();
            for line in &backlog {
                yield Ok(log_event(line));
            }

            loop {
                if state.log_hub.is_finished(&task_id).await {
                    while let Ok(line) = rx.try_recv() {
                        yield Ok(log_event(&line));
                    }
                    break;
                }

                let received = tokio::select! {
                    received = rx.recv() => Some(received),
                    _ = tokio::time::sleep(FINISH_POLL_INTERVAL) => None,
                };
                match received {
                    Some(Ok(line)) => yield Ok(log_event(&line)),
                    Some(Err(broadcast::error::RecvError::Lagged(n))) => {
                        warn!(task_id = %task_id, lagged = n, "Log subscriber lagged");
                    }
                    Some(Err(broadcast::error::RecvError::Closed)) => break,
                    None => {}
                }
            }
        }

        if let Some(task) = state.task_store.get_any(&task_id).await {
            let error_kind = task
                .result
                .as_ref()
                .and_then(|r| r.error_kind())
                .map(|k| k.as_str());
            yield Ok(Event::default().event("complete").data(
                json!({
                    "status": task.status.as_str(),
                    "success": task.result.as_ref().map(|r| r.success),
                    "error_kind": error_kind,
                }).to_string()
            ));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
