//! 镜像构建
//!
//! 每次构建使用独立的临时构建上下文（app.py + Dockerfile），
//! 上下文随 `TempDir` 释放，无论构建成功与否。

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::template::{RuntimeTemplate, APP_ENTRYPOINT};
use crate::domain::artifact::BuildArtifact;
use crate::domain::deploy::LogLine;
use crate::infra::command::{CommandError, CommandResult};
use crate::state::log_hub::LogSink;

/// 镜像构建工具链
#[async_trait]
pub trait BuildToolchain: Send + Sync {
    /// 在 `context_dir` 中构建并打上 `image` 标签
    async fn build(
        &self,
        context_dir: &Path,
        image: &str,
        timeout: Duration,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError>;
}

/// 构建错误
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("image build failed")]
    ToolchainFailure { log: Vec<LogLine> },
    #[error("image build timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        partial_log: Vec<LogLine>,
    },
}

impl BuildError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolchainFailure { .. } => "ToolchainFailure",
            Self::Timeout { .. } => "Timeout",
        }
    }

    pub fn log(&self) -> &[LogLine] {
        match self {
            Self::ToolchainFailure { log } => log,
            Self::Timeout { partial_log, .. } => partial_log,
        }
    }

    fn with_line(message: impl Into<String>) -> Self {
        Self::ToolchainFailure {
            log: vec![LogLine::stderr(message)],
        }
    }
}

/// 单次构建的输入
pub struct BuildSpec<'a> {
    pub app_name: &'a str,
    pub source_code: &'a str,
    pub registry_username: &'a str,
    pub container_port: u16,
}

/// 生成构建 ID：`<UTC yyyymmddHHMMSS>-<8 位随机十六进制>`
pub fn new_build_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), &random[..8])
}

/// 镜像引用：`<registry>/<user>/<app>:<build_id>`
pub fn image_reference(registry: &str, username: &str, app_name: &str, build_id: &str) -> String {
    format!(
        "{}/{}/{}:{}",
        registry.trim_end_matches('/'),
        username.to_ascii_lowercase(),
        app_name,
        build_id
    )
}

/// 源码 SHA-256（十六进制）
pub fn source_digest(source_code: &str) -> String {
    let digest = Sha256::digest(source_code.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 镜像构建器
pub struct ImageBuilder {
    toolchain: Arc<dyn BuildToolchain>,
    registry_host: String,
    template: RuntimeTemplate,
    timeout: Duration,
}

impl ImageBuilder {
    pub fn new(
        toolchain: Arc<dyn BuildToolchain>,
        registry_host: impl Into<String>,
        template: RuntimeTemplate,
        timeout: Duration,
    ) -> Self {
        Self {
            toolchain,
            registry_host: registry_host.into(),
            template,
            timeout,
        }
    }

    /// 构建镜像
    pub async fn build(
        &self,
        spec: &BuildSpec<'_>,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<BuildArtifact, BuildError> {
        let build_id = new_build_id();
        let image = image_reference(
            &self.registry_host,
            spec.registry_username,
            spec.app_name,
            &build_id,
        );

        let context = tempfile::Builder::new()
            .prefix("deployer-build-")
            .tempdir()
            .map_err(|e| BuildError::with_line(format!("failed to create build context: {}", e)))?;
        self.stage_context(context.path(), spec)
            .await
            .map_err(|e| BuildError::with_line(format!("failed to write build context: {}", e)))?;

        info!(
            app_name = %spec.app_name,
            build_id = %build_id,
            image = %image,
            "Building image"
        );

        let result = self
            .toolchain
            .build(context.path(), &image, self.timeout, log_tx, cancel)
            .await;
        // 构建上下文在这里释放
        drop(context);

        match result {
            Ok(result) if result.success => Ok(BuildArtifact {
                image_reference: image,
                build_id,
                source_digest: source_digest(spec.source_code),
                build_log: result.lines,
            }),
            Ok(result) if result.timed_out => {
                error!(app_name = %spec.app_name, build_id = %build_id, "Image build timed out");
                Err(BuildError::Timeout {
                    timeout: self.timeout,
                    partial_log: result.lines,
                })
            }
            Ok(result) => {
                error!(
                    app_name = %spec.app_name,
                    build_id = %build_id,
                    exit_code = ?result.exit_code,
                    "Image build failed"
                );
                Err(BuildError::ToolchainFailure { log: result.lines })
            }
            Err(e) => {
                error!(app_name = %spec.app_name, build_id = %build_id, error = %e, "Image build failed");
                Err(BuildError::with_line(e.to_string()))
            }
        }
    }

    async fn stage_context(&self, dir: &Path, spec: &BuildSpec<'_>) -> std::io::Result<()> {
        tokio::fs::write(dir.join(APP_ENTRYPOINT), spec.source_code).await?;
        tokio::fs::write(
            dir.join("Dockerfile"),
            self.template.dockerfile(spec.container_port),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::MockToolchain;
    use std::collections::HashSet;

    fn builder(toolchain: Arc<MockToolchain>) -> ImageBuilder {
        ImageBuilder::new(
            toolchain,
            "registry.example.com",
            RuntimeTemplate::default(),
            Duration::from_secs(30),
        )
    }

    fn spec<'a>(source: &'a str) -> BuildSpec<'a> {
        BuildSpec {
            app_name: "hello",
            source_code: source,
            registry_username: "Alice",
            container_port: 5000,
        }
    }

    #[test]
    fn test_build_id_format() {
        let id = new_build_id();
        let (stamp, random) = id.split_once('-').unwrap();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(random.len(), 8);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_image_reference() {
        assert_eq!(
            image_reference("docker.io/", "Alice", "hello", "20240101000000-abcdef01"),
            "docker.io/alice/hello:20240101000000-abcdef01"
        );
    }

    #[test]
    fn test_source_digest() {
        assert_eq!(
            source_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_build_stages_context_and_cleans_up() {
        let toolchain = Arc::new(MockToolchain::default());
        let artifact = builder(toolchain.clone())
            .build(&spec("print('hi')"), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(artifact
            .image_reference
            .starts_with("registry.example.com/alice/hello:"));
        assert!(artifact.image_reference.ends_with(&artifact.build_id));
        assert_eq!(artifact.source_digest, source_digest("print('hi')"));

        let call = toolchain.last_call().unwrap();
        assert_eq!(call.app_source, "print('hi')");
        assert!(call.dockerfile.contains("EXPOSE 5000"));
        assert_eq!(call.image, artifact.image_reference);
        // 构建上下文已删除
        assert!(!call.context_dir.exists());
    }

    #[tokio::test]
    async fn test_build_failure_keeps_log() {
        let toolchain = Arc::new(MockToolchain::default());
        toolchain.set_result(CommandResult::failed(
            1,
            vec![LogLine::stderr("ERROR: pip install failed")],
        ));

        let err = builder(toolchain.clone())
            .build(&spec("print('hi')"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ToolchainFailure");
        assert_eq!(err.log()[0].content, "ERROR: pip install failed");
        assert!(!toolchain.last_call().unwrap().context_dir.exists());
    }

    #[tokio::test]
    async fn test_build_timeout_keeps_partial_log() {
        let toolchain = Arc::new(MockToolchain::default());
        toolchain.set_result(CommandResult {
            timed_out: true,
            lines: vec![LogLine::stdout("#1 [internal] load build definition")],
            ..Default::default()
        });

        let err = builder(toolchain)
            .build(&spec("print('hi')"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { .. }));
        assert_eq!(err.log().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_builds_get_distinct_ids() {
        let toolchain = Arc::new(MockToolchain::default());
        let builder = Arc::new(builder(toolchain));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let builder = builder.clone();
                tokio::spawn(async move {
                    builder
                        .build(&spec("print('hi')"), None, &CancellationToken::new())
                        .await
                        .map(|a| (a.build_id, a.image_reference))
                })
            })
            .collect();

        let mut ids = HashSet::new();
        let mut images = HashSet::new();
        for handle in handles {
            let (id, image) = handle.await.unwrap().unwrap();
            ids.insert(id);
            images.insert(image);
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(images.len(), 16);
    }
}
