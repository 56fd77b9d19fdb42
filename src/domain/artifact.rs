//! 构建产物与集群提交结果

use serde::Serialize;

use super::deploy::LogLine;

/// 镜像构建产物
///
/// 只在单个部署请求内存活，推送成功或请求失败后丢弃
#[derive(Clone, Debug, Serialize)]
pub struct BuildArtifact {
    /// `<registry>/<user>/<app>:<build_id>`
    pub image_reference: String,
    pub build_id: String,
    /// 提交源码的 SHA-256
    pub source_digest: String,
    pub build_log: Vec<LogLine>,
}

/// 集群提交成功后的结果
#[derive(Clone, Debug, Serialize)]
pub struct ApplyOutcome {
    pub image: String,
    pub manifest_text: String,
    pub apply_logs: Vec<LogLine>,
    pub service_url_hint: Option<String>,
    pub applied_resources: Vec<String>,
}
