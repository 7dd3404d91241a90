use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::GridResult;
use crate::models::SystemInformation;

static STAMP: AtomicU64 = AtomicU64::new(1);

/// 进程内单调递增的版本戳，用于比较负载均衡器与工厂配置的新旧
pub fn next_stamp() -> u64 {
    STAMP.fetch_add(1, Ordering::Relaxed)
}

/// 当前负载均衡算法及参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingInfo {
    pub algorithm: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl LoadBalancingInfo {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn usize_parameter(&self, key: &str) -> Option<usize> {
        self.parameters
            .get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn f64_parameter(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(|v| v.as_f64())
    }
}

/// 决定每次分发多少任务的负载均衡器，由通道持有
pub trait Bundler: Send + Sync {
    fn algorithm(&self) -> &str;

    fn bundle_size(&self) -> usize;

    /// 一次完整往返后的反馈
    fn feedback(&mut self, _task_count: usize, _elapsed: Duration) {}

    /// 创建时的版本戳
    fn timestamp(&self) -> u64;

    fn setup(&mut self, _info: &SystemInformation) {}

    fn dispose(&mut self) {}

    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    fn restore(&mut self, _state: &serde_json::Value) {}
}

pub trait BundlerFactory: Send + Sync {
    fn current_info(&self) -> LoadBalancingInfo;

    /// 为通道创建负载均衡器，持久化中有状态时恢复
    fn load_bundler(&self, channel_id: &str) -> GridResult<(String, Box<dyn Bundler>)>;

    fn last_update_time(&self) -> u64;

    /// 配置的负载均衡器无法创建时使用
    fn fallback_bundler(&self) -> Box<dyn Bundler>;

    /// 尽力保存状态，失败只记录日志
    fn store_bundler(&self, _channel_id: &str, _algorithm: &str, _bundler: &dyn Bundler) {}
}

/// 负载均衡器状态的持久化
pub trait BundlerPersistence: Send + Sync {
    fn load(&self, channel_id: &str, algorithm: &str) -> GridResult<Option<serde_json::Value>>;

    fn store(&self, channel_id: &str, algorithm: &str, state: serde_json::Value) -> GridResult<()>;
}
