//! 部署上下文
//!
//! 单次部署的执行上下文：任务信息、日志出口、阶段进度

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::deploy::{DeployStage, LogLine, StageStatus};
use crate::state::log_hub::LogSink;
use crate::state::TaskStore;

/// 部署流水线阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Validate,
    Build,
    Push,
    Render,
    Apply,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::Validate,
        PipelineStage::Build,
        PipelineStage::Push,
        PipelineStage::Render,
        PipelineStage::Apply,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Build => "build",
            Self::Push => "push",
            Self::Render => "render",
            Self::Apply => "apply",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Validate => "Validate",
            Self::Build => "Image Build",
            Self::Push => "Image Push",
            Self::Render => "Render Manifest",
            Self::Apply => "Cluster Apply",
        }
    }

    fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

/// 部署执行上下文
pub struct DeployContext {
    /// 任务 ID
    pub task_id: String,
    /// 应用名称
    pub app_name: String,
    /// 目标 namespace
    pub namespace: String,
    /// 日志出口
    pub log_tx: LogSink,
    /// 取消令牌
    pub cancel_token: CancellationToken,
    task_store: Arc<TaskStore>,
    stages: Vec<DeployStage>,
}

impl DeployContext {
    pub fn new(
        task_id: String,
        app_name: String,
        namespace: String,
        log_tx: LogSink,
        cancel_token: CancellationToken,
        task_store: Arc<TaskStore>,
    ) -> Self {
        let stages = PipelineStage::ALL
            .iter()
            .map(|s| DeployStage::new(s.name(), s.display_name()))
            .collect();
        Self {
            task_id,
            app_name,
            namespace,
            log_tx,
            cancel_token,
            task_store,
            stages,
        }
    }

    /// 发送日志
    pub fn log(&self, stream: &str, content: &str) {
        self.log_tx.send(LogLine::new(stream, content));
    }

    /// 发送 stdout 日志
    pub fn log_stdout(&self, content: &str) {
        self.log("stdout", content);
    }

    /// 发送 stderr 日志
    pub fn log_stderr(&self, content: &str) {
        self.log("stderr", content);
    }

    /// 开始阶段
    pub async fn start(&mut self, stage: PipelineStage) {
        self.stages[stage.index()].start();
        self.log_stdout(&format!(
            "[{}/{}] {}",
            stage.index() + 1,
            PipelineStage::ALL.len(),
            stage.display_name()
        ));
        self.sync_stages().await;
    }

    /// 阶段成功
    pub async fn succeed(&mut self, stage: PipelineStage, message: Option<String>) {
        self.stages[stage.index()].finish(true, message);
        self.sync_stages().await;
    }

    /// 当前运行中的阶段失败，后续阶段标记为跳过
    pub async fn fail(&mut self, message: &str) {
        for stage in self.stages.iter_mut() {
            match stage.status {
                StageStatus::Running => stage.finish(false, Some(message.to_string())),
                StageStatus::Pending => stage.skip(None),
                _ => {}
            }
        }
        self.log_stderr(message);
        self.sync_stages().await;
    }

    /// 阶段快照
    pub fn stages(&self) -> Vec<DeployStage> {
        self.stages.clone()
    }

    /// 输出阶段汇总
    pub fn log_summary(&self) {
        self.log_stdout("=== Stage Summary ===");
        for stage in &self.stages {
            let duration = stage
                .duration_ms
                .map(|d| format!("{}ms", d))
                .unwrap_or_else(|| "-".to_string());
            let status_icon = match stage.status {
                StageStatus::Success => "✓",
                StageStatus::Failed => "✗",
                StageStatus::Skipped => "⊘",
                StageStatus::Running => "⟳",
                StageStatus::Pending => "○",
            };
            self.log_stdout(&format!("{} {} ({})", status_icon, stage.display_name, duration));
        }
    }

    async fn sync_stages(&self) {
        self.task_store
            .update_stages(&self.task_id, self.stages.clone())
            .await;
    }
}
