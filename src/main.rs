//! XJP App Deployer - 源码到集群的一键部署服务
//!
//! Usage:
//! - Normal mode: `xjp-app-deployer`
//! - With custom port: `xjp-app-deployer --port 19999`

use xjp_app_deployer::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("XJP App Deployer - 源码到集群的一键部署服务");
    println!();
    println!("USAGE:");
    println!("    xjp-app-deployer [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port (default: $PORT or 5000)");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    DEPLOYER_REGISTRY            Registry host (default: docker.io)");
    println!("    KUBECONFIG                   kubeconfig used by kubectl");
    println!("    DEPLOYER_DEFAULT_NAMESPACE   Namespace when the request has none");
    println!("    MONITOR_URL                  Audit monitor endpoint (optional)");
    println!("    RUST_LOG                     Log filter (default: info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args();
    xjp_app_deployer::init_and_run_with_config(config).await
}
