use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::sections::{
    validate_load_balancing, ClientConfig, DriverConfig, RemoteConfig, SchedulerConfig,
};
use crate::load_balancer::client_default_info;
use crate::logging::LogConfig;
use crate::traits::LoadBalancingInfo;

/// 系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub scheduler: SchedulerConfig,
    /// 客户端通道使用的负载均衡配置
    pub load_balancing: LoadBalancingInfo,
    pub remote: RemoteConfig,
    pub driver: DriverConfig,
    pub logging: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            scheduler: SchedulerConfig::default(),
            load_balancing: client_default_info(),
            remote: RemoteConfig::default(),
            driver: DriverConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 加载顺序:
    /// 1. 默认配置
    /// 2. 配置文件 (TOML)
    /// 3. 环境变量覆盖 (前缀 `GRID__`，层级分隔符 `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = toml::to_string(&AppConfig::default()).context("序列化默认配置失败")?;
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(&defaults, FileFormat::Toml));

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/grid.toml", "grid.toml", "/etc/grid/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GRID")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.client.validate().context("客户端配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        validate_load_balancing(&self.load_balancing).context("负载均衡配置验证失败")?;
        self.remote.validate().context("远程通道配置验证失败")?;
        self.driver.validate().context("驱动端配置验证失败")?;
        self.logging.validate().context("日志配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_round_trip_through_toml() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.load_balancing, config.load_balancing);
        assert_eq!(parsed.remote.max_jobs, 1);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
tick_interval_ms = 250

[load_balancing]
algorithm = "adaptive"

[load_balancing.parameters]
target_millis = 200
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 250);
        assert_eq!(config.load_balancing.algorithm, "adaptive");
        assert_eq!(config.load_balancing.usize_parameter("target_millis"), Some(200));
        assert!(config.client.local_execution_enabled);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load(Some("/nonexistent/grid.toml")).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.remote.reconnect_jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.load_balancing = LoadBalancingInfo::new("unknown");
        assert!(config.validate().is_err());
    }
}
