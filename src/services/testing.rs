//! 单元测试用的外部工具 mock

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::deploy::LogLine;
use crate::infra::command::{CommandError, CommandResult};
use crate::services::applier::ClusterClient;
use crate::services::builder::BuildToolchain;
use crate::services::registry::RegistryClient;
use crate::state::log_hub::LogSink;

fn forward(log_tx: Option<&LogSink>, result: &CommandResult) {
    if let Some(tx) = log_tx {
        for line in &result.lines {
            tx.send(line.clone());
        }
    }
}

/// Registry mock：按队列返回结果，队列为空时成功
#[derive(Default)]
pub struct MockRegistry {
    login_results: Mutex<VecDeque<CommandResult>>,
    push_results: Mutex<VecDeque<CommandResult>>,
    login_calls: AtomicUsize,
    push_calls: AtomicUsize,
    pushed: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub fn push_login_result(&self, result: CommandResult) {
        self.login_results.lock().unwrap().push_back(result);
    }

    pub fn push_push_result(&self, result: CommandResult) {
        self.push_results.lock().unwrap().push_back(result);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// 成功推送的镜像
    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    fn host(&self) -> &str {
        "registry.test"
    }

    async fn login(
        &self,
        _username: &str,
        _credential: &SecretString,
    ) -> Result<CommandResult, CommandError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .login_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| CommandResult::ok(vec![LogLine::stdout("Login Succeeded")])))
    }

    async fn push(
        &self,
        image: &str,
        _username: &str,
        _credential: &SecretString,
        log_tx: Option<&LogSink>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .push_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                CommandResult::ok(vec![LogLine::stdout(format!(
                    "{}: digest: sha256:0123abcd size: 1570",
                    image
                ))])
            });
        if result.success {
            self.pushed.lock().unwrap().push(image.to_string());
        }
        forward(log_tx, &result);
        Ok(result)
    }
}

/// 一次构建调用时看到的构建上下文
#[derive(Clone, Debug)]
pub struct ToolchainCall {
    pub context_dir: PathBuf,
    pub image: String,
    pub app_source: String,
    pub dockerfile: String,
}

/// 构建工具链 mock
#[derive(Default)]
pub struct MockToolchain {
    result: Mutex<Option<CommandResult>>,
    calls: Mutex<Vec<ToolchainCall>>,
}

impl MockToolchain {
    pub fn set_result(&self, result: CommandResult) {
        *self.result.lock().unwrap() = Some(result);
    }

    pub fn last_call(&self) -> Option<ToolchainCall> {
        self.calls.lock().unwrap().last().cloned()
    }

    pub fn build_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BuildToolchain for MockToolchain {
    async fn build(
        &self,
        context_dir: &Path,
        image: &str,
        _timeout: Duration,
        log_tx: Option<&LogSink>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let call = ToolchainCall {
            context_dir: context_dir.to_path_buf(),
            image: image.to_string(),
            app_source: std::fs::read_to_string(context_dir.join("app.py")).unwrap_or_default(),
            dockerfile: std::fs::read_to_string(context_dir.join("Dockerfile")).unwrap_or_default(),
        };
        self.calls.lock().unwrap().push(call);

        let result = self.result.lock().unwrap().clone().unwrap_or_else(|| {
            CommandResult::ok(vec![
                LogLine::stdout("#1 [internal] load build definition from Dockerfile"),
                LogLine::stdout(format!("#9 naming to {} done", image)),
            ])
        });
        forward(log_tx, &result);
        Ok(result)
    }
}

/// 集群 mock
///
/// apply 默认按清单内容生成 `kind/name created` 输出；
/// 工作负载状态先从队列取，队列为空时用默认状态
pub struct MockCluster {
    apply_result: Mutex<Option<CommandResult>>,
    workloads: Mutex<VecDeque<Value>>,
    default_workload: Mutex<Value>,
    service: Mutex<Value>,
    apply_calls: AtomicUsize,
    applied: Mutex<Vec<(String, String)>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self {
            apply_result: Mutex::new(None),
            workloads: Mutex::new(VecDeque::new()),
            default_workload: Mutex::new(Self::ready_workload(1)),
            service: Mutex::new(json!({
                "spec": {"type": "ClusterIP", "clusterIP": "10.0.0.7", "ports": [{"port": 5000}]}
            })),
            apply_calls: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }
}

impl MockCluster {
    pub fn ready_workload(replicas: u64) -> Value {
        json!({
            "metadata": {"generation": 1},
            "spec": {"replicas": replicas},
            "status": {
                "observedGeneration": 1,
                "replicas": replicas,
                "updatedReplicas": replicas,
                "readyReplicas": replicas,
                "availableReplicas": replicas
            }
        })
    }

    pub fn set_apply_result(&self, result: CommandResult) {
        *self.apply_result.lock().unwrap() = Some(result);
    }

    pub fn push_workload(&self, workload: Value) {
        self.workloads.lock().unwrap().push_back(workload);
    }

    pub fn set_default_workload(&self, workload: Value) {
        *self.default_workload.lock().unwrap() = workload;
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// 提交过的 (namespace, manifest)
    pub fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().unwrap().clone()
    }

    fn default_apply_output(manifest: &str) -> CommandResult {
        let lines = serde_yaml::Deserializer::from_str(manifest)
            .filter_map(|doc| serde_yaml::Value::deserialize(doc).ok())
            .filter_map(|doc| {
                let kind = doc["kind"].as_str()?.to_ascii_lowercase();
                let name = doc["metadata"]["name"].as_str()?.to_string();
                let resource = match kind.as_str() {
                    "deployment" | "statefulset" => format!("{}.apps", kind),
                    _ => kind,
                };
                Some(LogLine::stdout(format!("{}/{} created", resource, name)))
            })
            .collect();
        CommandResult::ok(lines)
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn apply(
        &self,
        manifest: &str,
        namespace: &str,
        log_tx: Option<&LogSink>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.applied
            .lock()
            .unwrap()
            .push((namespace.to_string(), manifest.to_string()));
        let result = self
            .apply_result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Self::default_apply_output(manifest));
        forward(log_tx, &result);
        Ok(result)
    }

    async fn get_json(
        &self,
        resource: &str,
        _namespace: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let value = if resource.starts_with("service/") {
            self.service.lock().unwrap().clone()
        } else if resource == "nodes" {
            json!({"items": [{"status": {"addresses": [{"type": "InternalIP", "address": "10.1.0.2"}]}}]})
        } else {
            let queued = self.workloads.lock().unwrap().pop_front();
            queued.unwrap_or_else(|| self.default_workload.lock().unwrap().clone())
        };
        Ok(CommandResult::ok(vec![LogLine::stdout(value.to_string())]))
    }
}
