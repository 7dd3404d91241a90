use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const HOST_PROPERTY: &str = "host";
pub const PROCESSORS_PROPERTY: &str = "available_processors";

/// 执行目标的能力描述，执行策略按键查询
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInformation {
    properties: BTreeMap<String, String>,
}

impl SystemInformation {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本机能力描述：主机名与可用处理器数
    pub fn local() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new()
            .with_property(HOST_PROPERTY, host)
            .with_property(PROCESSORS_PROPERTY, processors.to_string())
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.get(HOST_PROPERTY)
    }

    pub fn available_processors(&self) -> Option<usize> {
        self.get(PROCESSORS_PROPERTY).and_then(|v| v.parse().ok())
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// 通道的管理信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementInfo {
    pub uuid: String,
    pub host: String,
    pub local: bool,
}

impl ManagementInfo {
    pub fn new(uuid: impl Into<String>, host: impl Into<String>, local: bool) -> Self {
        Self {
            uuid: uuid.into(),
            host: host.into(),
            local,
        }
    }
}
