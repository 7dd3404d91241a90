use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use grid_core::config::AppConfig;
use grid_core::logging::{parse_component_levels, LogLevel, OutputFormat};
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::{wait_for_shutdown_signal, ShutdownManager};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("grid")
        .version("1.0.0")
        .about("网格计算作业分发引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找默认位置"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["local", "driver", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("tasks")
                .short('n')
                .long("tasks")
                .value_name("COUNT")
                .help("演示作业的任务数")
                .value_parser(clap::value_parser!(usize))
                .default_value("16"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "text"]),
        )
        .arg(
            Arg::new("log-components")
                .long("log-components")
                .value_name("LIST")
                .help("组件日志级别，例如 driver=debug,dispatcher=warn"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    apply_log_overrides(&mut config, &matches)?;
    grid_core::init_logging(&config.logging)?;

    info!("启动网格计算作业分发引擎");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");
    let app_mode = parse_app_mode(mode_str, &config)?;
    let task_count = matches.get_one::<usize>("tasks").copied().unwrap_or(16);

    let app = Application::new(config, app_mode).await?;
    let shutdown_manager = ShutdownManager::new();

    let outcome = {
        let run = app.run(task_count, shutdown_manager.subscribe());
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => outcome,
            _ = wait_for_shutdown_signal() => {
                info!("收到关闭信号，开始优雅关闭...");
                shutdown_manager.shutdown();
                match tokio::time::timeout(Duration::from_secs(30), &mut run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("等待作业结束超时，强制退出");
                        Err(anyhow::anyhow!("等待作业结束超时"))
                    }
                }
            }
        }
    };

    app.close().await;
    match outcome {
        Ok(_) => {
            info!("网格计算作业分发引擎已退出");
            Ok(())
        }
        Err(e) => {
            error!("应用运行失败: {e}");
            Err(e)
        }
    }
}

fn apply_log_overrides(config: &mut AppConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.parse::<LogLevel>()?;
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.parse::<OutputFormat>()?;
    }
    if let Some(list) = matches.get_one::<String>("log-components") {
        config.logging.components.extend(parse_component_levels(list)?);
    }
    Ok(())
}

/// 解析应用运行模式
fn parse_app_mode(mode_str: &str, config: &AppConfig) -> Result<AppMode> {
    match mode_str {
        "local" => {
            if !config.client.local_execution_enabled {
                return Err(anyhow::anyhow!("本地执行被禁用，请检查配置"));
            }
            Ok(AppMode::Local)
        }
        "driver" => Ok(AppMode::Driver),
        "all" => {
            if !config.client.local_execution_enabled {
                return Ok(AppMode::Driver);
            }
            Ok(AppMode::All)
        }
        _ => Err(anyhow::anyhow!("不支持的运行模式: {mode_str}")),
    }
}
