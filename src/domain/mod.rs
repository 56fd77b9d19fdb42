//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod artifact;
pub mod deploy;
pub mod manifest;
pub mod session;
pub mod validation;

// Re-exports for convenience
pub use artifact::{ApplyOutcome, BuildArtifact};
pub use deploy::{
    DeployErrorKind, DeployFailure, DeployRequest, DeployResult, DeployStage, DeployStatus,
    DeployTask, LogLine, ServiceExposure, StageStatus, WorkloadKind,
};
pub use manifest::Manifest;
pub use session::{RegistrySession, SessionStatus, SessionToken};
pub use validation::{Rejection, RejectionReason, ValidationResult};
