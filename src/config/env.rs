//! 环境变量配置加载

use std::env;
use std::time::Duration;
use tracing::warn;

use crate::config::template::RuntimeTemplate;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 服务监听端口
    pub port: u16,
    /// 镜像仓库配置
    pub registry: RegistryConfig,
    /// 构建配置
    pub build: BuildConfig,
    /// 集群配置
    pub cluster: ClusterConfig,
    /// 会话有效期
    pub session_ttl: Duration,
    /// 审计监控地址（可选）
    pub monitor_url: Option<String>,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let port = parse_env("PORT", 5000);
        let session_ttl = Duration::from_secs(parse_env("DEPLOYER_SESSION_TTL_SECS", 8 * 3600));
        let monitor_url = env::var("MONITOR_URL").ok().filter(|s| !s.is_empty());

        Self {
            port,
            registry: RegistryConfig::from_env(),
            build: BuildConfig::from_env(),
            cluster: ClusterConfig::from_env(),
            session_ttl,
            monitor_url,
        }
    }
}

/// 镜像仓库配置
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Registry 主机（如 docker.io、ghcr.io）
    pub host: String,
    /// docker 可执行文件
    pub docker_bin: String,
    /// 登录 / 推送超时
    pub push_timeout: Duration,
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        let host = load_with_fallback("DEPLOYER_REGISTRY", "DOCKER_REGISTRY")
            .unwrap_or_else(|| "docker.io".to_string());
        if env::var("DEPLOYER_REGISTRY").is_err() && env::var("DOCKER_REGISTRY").is_ok() {
            warn!("DOCKER_REGISTRY is deprecated, please use DEPLOYER_REGISTRY");
        }

        let docker_bin = env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        let push_timeout = Duration::from_secs(parse_env("DEPLOYER_PUSH_TIMEOUT_SECS", 300));

        Self {
            host: host.trim_end_matches('/').to_string(),
            docker_bin,
            push_timeout,
        }
    }
}

/// 构建配置
#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub timeout: Duration,
    pub template: RuntimeTemplate,
}

impl BuildConfig {
    pub fn from_env() -> Self {
        let timeout = Duration::from_secs(parse_env("DEPLOYER_BUILD_TIMEOUT_SECS", 600));
        Self {
            timeout,
            template: RuntimeTemplate::from_env(),
        }
    }
}

/// 集群配置
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub kubectl_bin: String,
    pub kubeconfig: Option<String>,
    pub default_namespace: String,
    pub max_replicas: u32,
    /// 等待 rollout 就绪的上限
    pub rollout_timeout: Duration,
    /// rollout 状态轮询间隔
    pub poll_interval: Duration,
    /// NodePort 访问提示使用的节点地址（不设置则从集群节点读取）
    pub node_address: Option<String>,
}

impl ClusterConfig {
    pub fn from_env() -> Self {
        let kubectl_bin = env::var("KUBECTL_BIN").unwrap_or_else(|_| "kubectl".to_string());
        let kubeconfig = env::var("KUBECONFIG").ok().filter(|s| !s.is_empty());
        let default_namespace = env::var("DEPLOYER_DEFAULT_NAMESPACE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "default".to_string());
        let max_replicas = parse_env("DEPLOYER_MAX_REPLICAS", 10u32).max(1);
        let rollout_timeout = Duration::from_secs(parse_env("DEPLOYER_ROLLOUT_TIMEOUT_SECS", 180));
        let poll_interval = Duration::from_millis(parse_env("DEPLOYER_ROLLOUT_POLL_MS", 2000));
        let node_address = env::var("DEPLOYER_NODE_ADDRESS").ok().filter(|s| !s.is_empty());

        Self {
            kubectl_bin,
            kubeconfig,
            default_namespace,
            max_replicas,
            rollout_timeout,
            poll_interval,
            node_address,
        }
    }
}

/// 读取并解析数值型环境变量，失败时使用默认值
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key = %key, value = %raw, "Invalid value, falling back to default");
                default
            }
        },
        Err(_) => default,
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    /// app_name 最大长度（Service 名称会追加 `-svc`）
    pub const MAX_APP_NAME_LEN: usize = 50;

    /// 任务历史最大保存数量
    pub const MAX_TASK_HISTORY: usize = 100;

    /// 最大活跃任务数
    pub const MAX_ACTIVE_TASKS: usize = 50;

    /// 瞬时连接错误重试前的等待（毫秒）
    pub const TRANSIENT_RETRY_BACKOFF_MS: u64 = 1500;

    /// 会话 cookie 名称
    pub const SESSION_COOKIE: &str = "deployer_session";

    /// 会话 header 名称（非浏览器客户端）
    pub const SESSION_HEADER: &str = "x-session-token";

    /// 后台清理间隔（秒）
    pub const CLEANUP_INTERVAL_SECS: u64 = 300;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
