//! 配置模块
//!
//! 环境变量解析与配置管理

pub mod env;
pub mod template;

pub use env::{BuildConfig, ClusterConfig, EnvConfig, RegistryConfig};
pub use template::RuntimeTemplate;
