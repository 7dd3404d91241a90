//! 配置管理
//!
//! [`AppConfig`] 由默认值、TOML 配置文件与 `GRID__` 前缀的环境变量依次叠加而成。

pub mod app_config;
pub mod sections;

pub use app_config::AppConfig;
pub use sections::{ClientConfig, DriverConfig, RemoteConfig, SchedulerConfig};
