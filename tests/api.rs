//! HTTP 接口集成测试
//!
//! 用内存实现替换 docker / kubectl，通过 `oneshot` 驱动完整路由

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use xjp_app_deployer::api;
use xjp_app_deployer::config::EnvConfig;
use xjp_app_deployer::domain::LogLine;
use xjp_app_deployer::infra::command::{CommandError, CommandResult};
use xjp_app_deployer::infra::MonitorClient;
use xjp_app_deployer::services::applier::ClusterClient;
use xjp_app_deployer::services::builder::BuildToolchain;
use xjp_app_deployer::services::registry::RegistryClient;
use xjp_app_deployer::state::log_hub::LogSink;
use xjp_app_deployer::state::{AppState, Collaborators};

const GOOD_TOKEN: &str = "dckr_pat_good";

struct FakeRegistry;

#[async_trait]
impl RegistryClient for FakeRegistry {
    fn host(&self) -> &str {
        "registry.test"
    }

    async fn login(
        &self,
        _username: &str,
        credential: &SecretString,
    ) -> Result<CommandResult, CommandError> {
        if credential.expose_secret() == GOOD_TOKEN {
            Ok(CommandResult::ok(vec![LogLine::stdout("Login Succeeded")]))
        } else {
            Ok(CommandResult::failed(
                1,
                vec![LogLine::stderr(
                    "Error response from daemon: unauthorized: incorrect username or password",
                )],
            ))
        }
    }

    async fn push(
        &self,
        image: &str,
        _username: &str,
        _credential: &SecretString,
        _log_tx: Option<&LogSink>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        Ok(CommandResult::ok(vec![LogLine::stdout(format!(
            "{}: digest: sha256:feedbeef size: 1570",
            image
        ))]))
    }
}

#[derive(Default)]
struct FakeToolchain {
    builds: AtomicUsize,
}

#[async_trait]
impl BuildToolchain for FakeToolchain {
    async fn build(
        &self,
        context_dir: &Path,
        image: &str,
        _timeout: Duration,
        log_tx: Option<&LogSink>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        assert!(context_dir.join("app.py").exists());
        assert!(context_dir.join("Dockerfile").exists());
        let line = LogLine::stdout(format!("Successfully tagged {}", image));
        if let Some(tx) = log_tx {
            tx.send(line.clone());
        }
        Ok(CommandResult::ok(vec![line]))
    }
}

struct FakeCluster;

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn apply(
        &self,
        manifest: &str,
        _namespace: &str,
        _log_tx: Option<&LogSink>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let mut lines = vec![LogLine::stdout("deployment.apps/hello configured")];
        if manifest.contains("kind: Service") {
            lines.push(LogLine::stdout("service/hello-svc configured"));
        }
        Ok(CommandResult::ok(lines))
    }

    async fn get_json(
        &self,
        resource: &str,
        _namespace: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let value = if resource.starts_with("service/") {
            json!({"spec": {"type": "ClusterIP", "clusterIP": "10.0.0.9", "ports": [{"port": 5000}]}})
        } else {
            json!({
                "metadata": {"generation": 1},
                "spec": {"replicas": 2},
                "status": {"observedGeneration": 1, "replicas": 2, "updatedReplicas": 2, "readyReplicas": 2, "availableReplicas": 2}
            })
        };
        Ok(CommandResult::ok(vec![LogLine::stdout(value.to_string())]))
    }
}

fn app() -> (Router, Arc<FakeToolchain>) {
    let mut config = EnvConfig::from_env();
    config.monitor_url = None;
    config.cluster.default_namespace = "default".to_string();
    config.cluster.max_replicas = 10;
    config.cluster.poll_interval = Duration::from_millis(10);
    config.cluster.node_address = None;

    let toolchain = Arc::new(FakeToolchain::default());
    let collaborators = Collaborators {
        registry: Arc::new(FakeRegistry),
        toolchain: toolchain.clone(),
        cluster: Arc::new(FakeCluster),
    };
    let state = AppState::with_collaborators(
        config,
        collaborators,
        MonitorClient::disabled(),
        CancellationToken::new(),
    );
    (api::router(Arc::new(state)), toolchain)
}

fn post_json(uri: &str, body: Value, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, cookie, body)
}

async fn login(app: &Router) -> String {
    let (status, cookie, body) = send(
        app,
        post_json(
            "/deployer-api/docker-login",
            json!({"docker_user": "alice", "docker_token": GOOD_TOKEN}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);
    cookie.expect("session cookie")
}

fn deploy_body() -> Value {
    json!({
        "app_name": "hello",
        "code": "from flask import Flask\napp = Flask(__name__)\n",
        "k8s_kind": "Deployment",
        "replicas": 2,
        "service_type": "ClusterIP",
        "container_port": 5000
    })
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app();
    let (status, _, body) = send(&app, get("/deployer-api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["registry"], "registry.test");
}

#[tokio::test]
async fn test_login_with_bad_token_sets_no_cookie() {
    let (app, _) = app();
    let (status, cookie, body) = send(
        &app,
        post_json(
            "/deployer-api/docker-login",
            json!({"docker_user": "alice", "docker_token": "wrong"}),
            None,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(cookie.is_none());
    assert_eq!(body["success"], false);
    assert_eq!(body["error_kind"], "InvalidCredential");
}

#[tokio::test]
async fn test_login_missing_fields() {
    let (app, _) = app();
    let (status, _, body) = send(
        &app,
        post_json("/deployer-api/docker-login", json!({"docker_user": "alice"}), None),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_kind"], "MissingCredentials");
}

#[tokio::test]
async fn test_deploy_requires_login() {
    let (app, toolchain) = app();
    let (status, _, body) = send(&app, post_json("/deployer-api/deploy", deploy_body(), None)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error_kind"], "Unauthenticated");
    assert_eq!(toolchain.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_login_then_deploy() {
    let (app, toolchain) = app();
    let cookie = login(&app).await;

    let (status, _, body) = send(
        &app,
        post_json("/deployer-api/deploy", deploy_body(), Some(&cookie)),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);
    assert!(body["image"]
        .as_str()
        .unwrap()
        .starts_with("registry.test/alice/hello:"));
    assert!(body["manifest"].as_str().unwrap().contains("replicas: 2"));
    assert_eq!(body["service_url_hint"], "http://10.0.0.9:5000/");
    assert_eq!(toolchain.builds.load(Ordering::SeqCst), 1);

    // 任务可查询
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let (status, _, task) = send(&app, get(&format!("/deployer-api/deploys/{}", task_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "success");
    assert_eq!(task["result"]["success"], true);

    let (_, _, recent) = send(&app, get("/deployer-api/deploys/recent?app_name=hello")).await;
    assert_eq!(recent["total"], 1);
    assert_eq!(recent["tasks"][0]["id"], task_id.as_str());
}

#[tokio::test]
async fn test_logout_blocks_deploy() {
    let (app, toolchain) = app();
    let cookie = login(&app).await;

    let (status, cleared, body) = send(
        &app,
        post_json("/deployer-api/docker-logout", json!({}), Some(&cookie)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(cleared.as_deref(), Some("deployer_session="));

    let (status, _, body) = send(
        &app,
        post_json("/deployer-api/deploy", deploy_body(), Some(&cookie)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_kind"], "Unauthenticated");
    assert_eq!(toolchain.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_validate_rejects_policy_violation() {
    let (app, _) = app();
    let (status, _, body) = send(
        &app,
        post_json(
            "/deployer-api/validate",
            json!({"app_name": "hello", "code": "import subprocess\n"}),
            None,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert_eq!(body["reason"], "PolicyViolation");

    let (_, _, body) = send(
        &app,
        post_json(
            "/deployer-api/validate",
            json!({"app_name": "hello", "code": "print('ok')\n"}),
            None,
        ),
    )
    .await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["app_name"], "hello");
}

#[tokio::test]
async fn test_deploy_rejects_invalid_parameters() {
    let (app, toolchain) = app();
    let cookie = login(&app).await;

    let mut body = deploy_body();
    body["replicas"] = json!(0);
    let (status, _, result) = send(&app, post_json("/deployer-api/deploy", body, Some(&cookie))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(result["error_kind"], "ValidationFailed");
    assert_eq!(result["reason"], "InvalidParameter");

    let mut body = deploy_body();
    body["k8s_kind"] = json!("DaemonSet");
    let (status, _, result) = send(&app, post_json("/deployer-api/deploy", body, Some(&cookie))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(result["error_kind"], "bad_request");

    assert_eq!(toolchain.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_detached_deploy_and_log_stream() {
    let (app, _) = app();
    let cookie = login(&app).await;

    let (status, _, body) = send(
        &app,
        post_json("/deployer-api/deploy?detach=true", deploy_body(), Some(&cookie)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_str().unwrap().to_string();
    assert_eq!(
        body["stream_url"],
        format!("/deployer-api/deploys/{}/logs/stream", task_id).as_str()
    );

    // 等待后台部署结束
    let mut finished = false;
    for _ in 0..200 {
        let (_, _, task) = send(&app, get(&format!("/deployer-api/deploys/{}", task_id))).await;
        if task["status"] != "running" {
            assert_eq!(task["status"], "success");
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(finished, "deployment did not finish");

    // 已结束的任务：回放日志后发送 complete 事件
    let response = app
        .clone()
        .oneshot(get(&format!("/deployer-api/deploys/{}/logs/stream", task_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("event: log"));
    assert!(text.contains("Successfully tagged registry.test/alice/hello:"));
    assert!(text.contains("event: complete"));
}

#[tokio::test]
async fn test_unknown_task() {
    let (app, _) = app();
    let (status, _, body) = send(&app, get("/deployer-api/deploys/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_kind"], "not_found");

    let response = app
        .clone()
        .oneshot(get("/deployer-api/deploys/does-not-exist/logs/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
