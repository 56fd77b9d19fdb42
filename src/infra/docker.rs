//! Docker CLI 封装
//!
//! registry 登录和推送都在临时的 `--config` 目录里进行，
//! 凭据只经 stdin 传入，不会写进宿主机的 `~/.docker/config.json`

use async_trait::async_trait;
use secrecy::SecretString;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::env::RegistryConfig;
use crate::domain::deploy::LogLine;
use crate::infra::command::{CommandError, CommandResult, CommandRunner, CommandSpec};
use crate::services::builder::BuildToolchain;
use crate::services::registry::RegistryClient;
use crate::state::log_hub::LogSink;

/// 登录超时
const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Docker CLI
pub struct DockerCli {
    docker_bin: String,
    host: String,
    push_timeout: Duration,
}

impl DockerCli {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            host: config.host.clone(),
            push_timeout: config.push_timeout,
        }
    }

    /// `docker --config <dir> login <host> -u <user> --password-stdin`
    pub fn login_spec(&self, config_dir: &Path, username: &str, credential: &SecretString) -> CommandSpec {
        CommandSpec::new(&self.docker_bin, LOGIN_TIMEOUT)
            .arg("--config")
            .arg(config_dir.to_string_lossy())
            .args(["login", self.host.as_str(), "-u", username, "--password-stdin"])
            .stdin(credential.clone())
    }

    /// `docker --config <dir> push <image>`
    pub fn push_spec(&self, config_dir: &Path, image: &str) -> CommandSpec {
        CommandSpec::new(&self.docker_bin, self.push_timeout)
            .arg("--config")
            .arg(config_dir.to_string_lossy())
            .args(["push", image])
    }

    /// `docker build -t <image> <context>`
    pub fn build_spec(&self, context_dir: &Path, image: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(&self.docker_bin, timeout)
            .args(["build", "-t", image])
            .arg(context_dir.to_string_lossy())
            .current_dir(context_dir)
    }

    /// 临时 docker 配置目录，释放时删除（连同其中的凭据）
    fn scratch_config() -> Result<tempfile::TempDir, CommandError> {
        tempfile::Builder::new()
            .prefix("deployer-docker-")
            .tempdir()
            .map_err(CommandError::SpawnFailed)
    }
}

#[async_trait]
impl RegistryClient for DockerCli {
    fn host(&self) -> &str {
        &self.host
    }

    async fn login(
        &self,
        username: &str,
        credential: &SecretString,
    ) -> Result<CommandResult, CommandError> {
        let config_dir = Self::scratch_config()?;
        let spec = self.login_spec(config_dir.path(), username, credential);
        info!(command = %spec.display(), "Verifying registry credential");
        CommandRunner::run(&spec, None, &CancellationToken::new()).await
    }

    async fn push(
        &self,
        image: &str,
        username: &str,
        credential: &SecretString,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let config_dir = Self::scratch_config()?;

        let login = CommandRunner::run(
            &self.login_spec(config_dir.path(), username, credential),
            None,
            cancel,
        )
        .await?;
        if !login.success {
            return Ok(login);
        }

        let spec = self.push_spec(config_dir.path(), image);
        if let Some(tx) = log_tx {
            tx.send(LogLine::stdout(format!("$ {}", spec.display())));
        }
        CommandRunner::run(&spec, log_tx, cancel).await
    }
}

#[async_trait]
impl BuildToolchain for DockerCli {
    async fn build(
        &self,
        context_dir: &Path,
        image: &str,
        timeout: Duration,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let spec = self.build_spec(context_dir, image, timeout);
        if let Some(tx) = log_tx {
            tx.send(LogLine::stdout(format!("$ {}", spec.display())));
        }
        CommandRunner::run(&spec, log_tx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> DockerCli {
        DockerCli {
            docker_bin: "docker".to_string(),
            host: "ghcr.io".to_string(),
            push_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_login_spec_keeps_credential_off_command_line() {
        let credential = SecretString::from("dckr_pat_secret".to_string());
        let spec = cli().login_spec(Path::new("/tmp/cfg"), "alice", &credential);

        assert_eq!(
            spec.args,
            vec!["--config", "/tmp/cfg", "login", "ghcr.io", "-u", "alice", "--password-stdin"]
        );
        assert!(!spec.display().contains("dckr_pat_secret"));
        assert!(spec.display().ends_with("< (stdin)"));
    }

    #[test]
    fn test_push_and_build_specs() {
        let push = cli().push_spec(Path::new("/tmp/cfg"), "ghcr.io/alice/hello:1");
        assert_eq!(push.args, vec!["--config", "/tmp/cfg", "push", "ghcr.io/alice/hello:1"]);
        assert_eq!(push.timeout, Duration::from_secs(300));

        let build = cli().build_spec(Path::new("/tmp/ctx"), "ghcr.io/alice/hello:1", Duration::from_secs(60));
        assert_eq!(build.args, vec!["build", "-t", "ghcr.io/alice/hello:1", "/tmp/ctx"]);
        assert_eq!(build.work_dir.as_deref(), Some(Path::new("/tmp/ctx")));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let docker = DockerCli {
            docker_bin: "nonexistent_docker_12345".to_string(),
            ..cli()
        };
        let result = docker
            .login("alice", &SecretString::from("pat".to_string()))
            .await;
        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }
}
