//! 基础设施模块
//!
//! 封装外部依赖（docker / kubectl CLI、审计 HTTP client、命令执行）

pub mod command;
pub mod docker;
pub mod kubectl;
pub mod monitor;

pub use command::CommandRunner;
pub use docker::DockerCli;
pub use kubectl::KubectlCli;
pub use monitor::MonitorClient;
