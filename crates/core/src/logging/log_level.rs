use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{GridError, GridResult};

/// 日志级别，`off` 关闭对应组件的输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = GridError;

    fn from_str(level: &str) -> Result<Self, Self::Err> {
        match level.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(GridError::Configuration(format!("无效的日志级别: {level}"))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// 可单独设置日志级别的组件，对应各 crate 的 tracing target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    Core,
    Dispatcher,
    Driver,
}

impl Component {
    pub fn target(self) -> &'static str {
        match self {
            Component::Core => "grid_core",
            Component::Dispatcher => "grid_dispatcher",
            Component::Driver => "grid_driver",
        }
    }
}

impl FromStr for Component {
    type Err = GridError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_lowercase().as_str() {
            "core" | "grid_core" => Ok(Component::Core),
            "dispatcher" | "client" | "grid_dispatcher" => Ok(Component::Dispatcher),
            "driver" | "grid_driver" => Ok(Component::Driver),
            _ => Err(GridError::Configuration(format!("未知的日志组件: {name}"))),
        }
    }
}

/// 解析 `driver=debug,dispatcher=warn` 形式的组件级别列表
pub fn parse_component_levels(spec: &str) -> GridResult<BTreeMap<String, LogLevel>> {
    let mut levels = BTreeMap::new();
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, level) = item
            .split_once('=')
            .ok_or_else(|| GridError::Configuration(format!("组件日志级别格式错误: {item}")))?;
        let component: Component = name.parse()?;
        levels.insert(component_key(component).to_string(), level.parse()?);
    }
    Ok(levels)
}

fn component_key(component: Component) -> &'static str {
    match component {
        Component::Core => "core",
        Component::Dispatcher => "dispatcher",
        Component::Driver => "driver",
    }
}

/// 组合 EnvFilter 指令：全局级别在前，组件级别按 target 覆盖
pub fn filter_directives(
    level: LogLevel,
    components: &BTreeMap<String, LogLevel>,
) -> GridResult<String> {
    let mut directives = vec![level.as_str().to_string()];
    for (name, component_level) in components {
        let component: Component = name.parse()?;
        directives.push(format!("{}={}", component.target(), component_level));
    }
    Ok(directives.join(","))
}
