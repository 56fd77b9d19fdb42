//! XJP App Deployer - 源码到集群的一键部署服务
//!
//! 校验提交的 Python 源码，构建并推送镜像，渲染 Kubernetes 清单后提交到集群

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::env::constants::{CLEANUP_INTERVAL_SECS, VERSION};
use crate::config::EnvConfig;
use crate::infra::CommandRunner;
use crate::state::AppState;

/// 命令行覆盖的运行参数
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖 `PORT`
    pub port_override: Option<u16>,
}

/// 初始化日志（`RUST_LOG`，默认 info）
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// 加载配置并启动 HTTP 服务，直到收到关闭信号
pub async fn init_and_run_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    init_tracing();

    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }

    info!(
        version = VERSION,
        registry = %config.registry.host,
        namespace = %config.cluster.default_namespace,
        "XJP App Deployer starting"
    );

    probe_tool(&config.registry.docker_bin, &["version", "--format", "{{.Client.Version}}"]).await;
    probe_tool(&config.cluster.kubectl_bin, &["version", "--client"]).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(AppState::new(config)?);
    let shutdown = state.shutdown.clone();

    tokio::spawn(housekeeping_loop(state.clone()));

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("XJP App Deployer stopped");
    Ok(())
}

/// 启动时检查外部工具是否可用（不可用只告警，部署时才会失败）
async fn probe_tool(program: &str, args: &[&str]) {
    match CommandRunner::run_simple(program, args, Duration::from_secs(10)).await {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            info!(
                tool = %program,
                version = %version.lines().next().unwrap_or("").trim(),
                "Toolchain available"
            );
        }
        Ok(output) => {
            warn!(
                tool = %program,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Toolchain probe failed"
            );
        }
        Err(e) => warn!(tool = %program, error = %e, "Toolchain not available"),
    }
}

/// 定期清理过期会话、任务和日志通道
async fn housekeeping_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
    // 第一次 tick 立即返回
    interval.tick().await;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => state.housekeeping().await,
        }
    }
}

/// Ctrl-C / SIGTERM 时取消全局令牌，正在运行的工具进程随之终止
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
