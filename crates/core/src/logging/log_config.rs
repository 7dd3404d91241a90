use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::GridResult;
use crate::logging::log_level::{filter_directives, parse_component_levels, LogLevel};

/// 日志配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    /// 组件级别覆盖，键为 core / dispatcher / driver
    #[serde(default)]
    pub components: BTreeMap<String, LogLevel>,
    pub format: OutputFormat,
    /// 是否输出事件的 target
    pub include_target: bool,
    pub include_thread_ids: bool,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
    Pretty,
}

impl FromStr for OutputFormat {
    type Err = crate::errors::GridError;

    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            "pretty" => Ok(OutputFormat::Pretty),
            _ => Err(crate::errors::GridError::Configuration(format!(
                "Invalid log format: {format}"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            components: BTreeMap::new(),
            format: OutputFormat::Pretty,
            include_target: true,
            include_thread_ids: false,
        }
    }
}

impl LogConfig {
    /// 从环境变量创建配置：LOG_LEVEL、LOG_COMPONENTS、LOG_FORMAT、LOG_THREAD_IDS
    pub fn from_env() -> Self {
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogLevel::Info);
        let mut config = Self::with_level(level);
        if let Ok(spec) = std::env::var("LOG_COMPONENTS") {
            config.components = parse_component_levels(&spec).unwrap_or_default();
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = format.parse().unwrap_or(OutputFormat::Pretty);
        }
        if let Ok(value) = std::env::var("LOG_THREAD_IDS") {
            config.include_thread_ids = value.eq_ignore_ascii_case("true");
        }
        config
    }

    pub fn with_level(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_component(mut self, component: &str, level: LogLevel) -> Self {
        self.components.insert(component.to_string(), level);
        self
    }

    /// EnvFilter 指令字符串
    pub fn filter_directives(&self) -> GridResult<String> {
        filter_directives(self.level, &self.components)
    }

    pub fn validate(&self) -> GridResult<()> {
        self.filter_directives().map(|_| ())
    }
}
