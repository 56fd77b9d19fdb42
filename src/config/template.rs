//! 运行时模板
//!
//! 所有应用共用一份固定的 Dockerfile 模板，只有基础镜像、依赖包和端口可配置

use std::env;

/// 应用源码在构建上下文中的文件名
pub const APP_ENTRYPOINT: &str = "app.py";

/// 运行时模板配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeTemplate {
    /// 基础镜像
    pub base_image: String,
    /// 构建时安装的 pip 包
    pub pip_packages: Vec<String>,
}

impl Default for RuntimeTemplate {
    fn default() -> Self {
        Self {
            base_image: "python:3.10-slim".to_string(),
            pip_packages: vec!["flask".to_string()],
        }
    }
}

impl RuntimeTemplate {
    /// 从环境变量加载模板配置
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_image = env::var("DEPLOYER_BASE_IMAGE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.base_image);

        // 逗号或空白分隔，例如 "flask,gunicorn"
        let pip_packages = env::var("DEPLOYER_PIP_PACKAGES")
            .map(|v| {
                v.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.pip_packages);

        Self {
            base_image,
            pip_packages,
        }
    }

    /// 渲染 Dockerfile
    pub fn dockerfile(&self, container_port: u16) -> String {
        let mut lines = vec![
            format!("FROM {}", self.base_image),
            "WORKDIR /app".to_string(),
            format!("COPY {} /app/", APP_ENTRYPOINT),
        ];
        if !self.pip_packages.is_empty() {
            lines.push(format!(
                "RUN pip install --no-cache-dir {}",
                self.pip_packages.join(" ")
            ));
        }
        lines.push(format!("ENV PORT={0} FLASK_RUN_PORT={0}", container_port));
        lines.push(format!("EXPOSE {}", container_port));
        lines.push(format!("CMD [\"python\", \"{}\"]", APP_ENTRYPOINT));

        let mut dockerfile = lines.join("\n");
        dockerfile.push('\n');
        dockerfile
    }
}
