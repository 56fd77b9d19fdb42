//! 镜像推送
//!
//! 用会话里保存的凭据推送镜像，网络类错误重试一次

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::artifact::BuildArtifact;
use crate::domain::deploy::LogLine;
use crate::domain::session::RegistrySession;
use crate::infra::command::CommandError;
use crate::services::registry::{
    classify_result, default_retry_backoff, summarize, RegistryClient, RegistryFailure,
};
use crate::state::log_hub::LogSink;

/// 推送错误
#[derive(Debug, Error)]
pub enum PushError {
    #[error("registry rejected the session credential")]
    Unauthorized { log: Vec<LogLine> },
    #[error("registry unreachable: {message}")]
    RegistryUnreachable { message: String, log: Vec<LogLine> },
    #[error("registry quota exceeded")]
    QuotaExceeded { log: Vec<LogLine> },
    #[error("push rejected: {message}")]
    Rejected { message: String, log: Vec<LogLine> },
}

impl PushError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "Unauthorized",
            Self::RegistryUnreachable { .. } => "RegistryUnreachable",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::Rejected { .. } => "Rejected",
        }
    }

    pub fn log(&self) -> &[LogLine] {
        match self {
            Self::Unauthorized { log }
            | Self::RegistryUnreachable { log, .. }
            | Self::QuotaExceeded { log }
            | Self::Rejected { log, .. } => log,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// 镜像推送器
pub struct RegistryPublisher {
    registry: Arc<dyn RegistryClient>,
    retry_backoff: Duration,
}

impl RegistryPublisher {
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self {
            registry,
            retry_backoff: default_retry_backoff(),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// 推送镜像，成功时返回推送日志
    pub async fn push(
        &self,
        session: &RegistrySession,
        artifact: &BuildArtifact,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LogLine>, PushError> {
        if !session.is_authenticated() {
            return Err(PushError::Unauthorized {
                log: vec![LogLine::stderr("registry session is not authenticated")],
            });
        }

        let mut log = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .registry
                .push(
                    &artifact.image_reference,
                    &session.registry_username,
                    &session.credential,
                    log_tx,
                    cancel,
                )
                .await;

            let error = match outcome {
                Ok(result) if result.success => {
                    log.extend(result.lines);
                    info!(
                        session_id = %session.session_id,
                        image = %artifact.image_reference,
                        "Image pushed"
                    );
                    return Ok(log);
                }
                Ok(result) => {
                    let class = classify_result(&result);
                    let message = summarize(&result);
                    log.extend(result.lines);
                    match class {
                        RegistryFailure::Unauthorized => PushError::Unauthorized { log },
                        RegistryFailure::QuotaExceeded => PushError::QuotaExceeded { log },
                        RegistryFailure::Unreachable => {
                            PushError::RegistryUnreachable { message, log }
                        }
                        RegistryFailure::Other => PushError::Rejected { message, log },
                    }
                }
                Err(CommandError::Cancelled) => {
                    log.push(LogLine::stderr("push cancelled"));
                    return Err(PushError::Rejected {
                        message: "push cancelled".to_string(),
                        log,
                    });
                }
                Err(e) => {
                    log.push(LogLine::stderr(e.to_string()));
                    PushError::RegistryUnreachable {
                        message: e.to_string(),
                        log,
                    }
                }
            };

            if let PushError::RegistryUnreachable { message, log: failed_log } = error {
                if attempt < 2 {
                    warn!(
                        image = %artifact.image_reference,
                        error = %message,
                        "Push failed transiently, retrying"
                    );
                    log = failed_log;
                    tokio::time::sleep(self.retry_backoff).await;
                    continue;
                }
                return Err(PushError::RegistryUnreachable {
                    message,
                    log: failed_log,
                });
            }

            warn!(
                session_id = %session.session_id,
                image = %artifact.image_reference,
                kind = error.kind(),
                "Image push failed"
            );
            return Err(error);
        }
    }
}
