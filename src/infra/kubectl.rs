//! kubectl 封装

use async_trait::async_trait;
use secrecy::SecretString;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::env::ClusterConfig;
use crate::domain::deploy::LogLine;
use crate::infra::command::{CommandError, CommandResult, CommandRunner, CommandSpec};
use crate::services::applier::ClusterClient;
use crate::state::log_hub::LogSink;

/// 单次 kubectl 调用超时
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(60);

/// kubectl CLI
pub struct KubectlCli {
    kubectl_bin: String,
    kubeconfig: Option<String>,
}

impl KubectlCli {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            kubectl_bin: config.kubectl_bin.clone(),
            kubeconfig: config.kubeconfig.clone(),
        }
    }

    fn base_spec(&self) -> CommandSpec {
        let spec = CommandSpec::new(&self.kubectl_bin, KUBECTL_TIMEOUT);
        match self.kubeconfig {
            Some(ref path) => spec.arg("--kubeconfig").arg(path),
            None => spec,
        }
    }

    /// `kubectl apply -n <ns> -f -`，清单从 stdin 传入
    pub fn apply_spec(&self, manifest: &str, namespace: &str) -> CommandSpec {
        self.base_spec()
            .args(["apply", "-n", namespace, "-f", "-"])
            .stdin(SecretString::from(manifest.to_string()))
    }

    /// `kubectl get <resource> [-n <ns>] -o json`
    pub fn get_spec(&self, resource: &str, namespace: Option<&str>) -> CommandSpec {
        let spec = self.base_spec().args(["get", resource]);
        let spec = match namespace {
            Some(ns) => spec.args(["-n", ns]),
            None => spec,
        };
        spec.args(["-o", "json"])
    }
}

#[async_trait]
impl ClusterClient for KubectlCli {
    async fn apply(
        &self,
        manifest: &str,
        namespace: &str,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let spec = self.apply_spec(manifest, namespace);
        if let Some(tx) = log_tx {
            tx.send(LogLine::stdout(format!("$ {}", spec.display())));
        }
        CommandRunner::run(&spec, log_tx, cancel).await
    }

    async fn get_json(
        &self,
        resource: &str,
        namespace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        CommandRunner::run(&self.get_spec(resource, namespace), None, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_spec() {
        let kubectl = KubectlCli {
            kubectl_bin: "kubectl".to_string(),
            kubeconfig: Some("/etc/deployer/kubeconfig".to_string()),
        };
        let spec = kubectl.apply_spec("kind: Deployment\n", "team-a");
        assert_eq!(
            spec.args,
            vec!["--kubeconfig", "/etc/deployer/kubeconfig", "apply", "-n", "team-a", "-f", "-"]
        );
        assert!(spec.display().ends_with("< (stdin)"));
    }

    #[test]
    fn test_get_spec() {
        let kubectl = KubectlCli {
            kubectl_bin: "kubectl".to_string(),
            kubeconfig: None,
        };
        assert_eq!(
            kubectl.get_spec("deployment/hello", Some("default")).args,
            vec!["get", "deployment/hello", "-n", "default", "-o", "json"]
        );
        assert_eq!(kubectl.get_spec("nodes", None).args, vec!["get", "nodes", "-o", "json"]);
    }

    #[tokio::test]
    async fn test_apply_feeds_manifest_on_stdin() {
        // 用 cat 代替 kubectl，验证清单通过 stdin 传入
        let kubectl = KubectlCli {
            kubectl_bin: "sh".to_string(),
            kubeconfig: None,
        };
        let mut spec = kubectl.apply_spec("kind: Service\n", "default");
        spec.args = vec!["-c".to_string(), "cat".to_string()];

        let result = CommandRunner::run(&spec, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout_text(), "kind: Service");
    }
}
