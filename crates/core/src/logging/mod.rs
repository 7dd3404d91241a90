pub mod log_config;
pub mod log_level;

pub use log_config::{LogConfig, OutputFormat};
pub use log_level::{parse_component_levels, Component, LogLevel};

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化全局日志订阅者；RUST_LOG 优先于配置的级别
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives = config.filter_directives()?;
            EnvFilter::try_new(&directives).with_context(|| format!("无效的日志过滤指令: {directives}"))?
        }
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids);

    match config.format {
        OutputFormat::Json => registry
            .with(layer.json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        OutputFormat::Pretty => registry
            .with(layer.pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        OutputFormat::Text => registry
            .with(layer)
            .try_init()
            .context("初始化文本日志格式失败")?,
    }

    Ok(())
}
