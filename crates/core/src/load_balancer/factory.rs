use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::adaptive::{AdaptiveBundler, AdaptiveParameters, ADAPTIVE};
use super::manual::{ManualBundler, MANUAL};
use crate::errors::{GridError, GridResult};
use crate::sync;
use crate::traits::{next_stamp, Bundler, BundlerFactory, BundlerPersistence, LoadBalancingInfo};

pub const SUPPORTED_ALGORITHMS: [&str; 2] = [MANUAL, ADAPTIVE];

/// 客户端默认：手动，任务束大小 1,000,000
pub fn client_default_info() -> LoadBalancingInfo {
    LoadBalancingInfo::new(MANUAL).with_parameter("size", 1_000_000u64)
}

/// 驱动端默认：自适应
pub fn driver_default_info() -> LoadBalancingInfo {
    LoadBalancingInfo::new(ADAPTIVE)
}

/// 负载均衡器工厂；更新配置时推进版本戳，通道据此重建负载均衡器
pub struct LoadBalancerFactory {
    current: RwLock<LoadBalancingInfo>,
    last_update: AtomicU64,
    persistence: Option<Arc<dyn BundlerPersistence>>,
}

impl LoadBalancerFactory {
    pub fn new(info: LoadBalancingInfo) -> GridResult<Self> {
        validate_info(&info)?;
        Ok(Self {
            current: RwLock::new(info),
            last_update: AtomicU64::new(next_stamp()),
            persistence: None,
        })
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn BundlerPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// 替换全局负载均衡配置
    pub fn update_configuration(&self, info: LoadBalancingInfo) -> GridResult<()> {
        validate_info(&info)?;
        info!("更新负载均衡配置: {} {:?}", info.algorithm, info.parameters);
        *sync::write(&self.current) = info;
        self.last_update.store(next_stamp(), Ordering::Release);
        Ok(())
    }

    pub fn new_bundler(&self, info: &LoadBalancingInfo) -> GridResult<Box<dyn Bundler>> {
        match info.algorithm.as_str() {
            MANUAL => Ok(Box::new(ManualBundler::new(
                info.usize_parameter("size").unwrap_or(1),
            ))),
            ADAPTIVE => {
                let defaults = AdaptiveParameters::default();
                let params = AdaptiveParameters {
                    initial_size: info
                        .usize_parameter("initial_size")
                        .unwrap_or(defaults.initial_size),
                    target_duration: info
                        .usize_parameter("target_millis")
                        .map(|ms| Duration::from_millis(ms as u64))
                        .unwrap_or(defaults.target_duration),
                    performance_cache_size: info
                        .usize_parameter("performance_cache_size")
                        .unwrap_or(defaults.performance_cache_size),
                    max_size: info.usize_parameter("max_size").unwrap_or(defaults.max_size),
                };
                Ok(Box::new(AdaptiveBundler::new(params)))
            }
            other => Err(GridError::LoadBalancer(format!(
                "不支持的负载均衡算法: {other}"
            ))),
        }
    }
}

impl BundlerFactory for LoadBalancerFactory {
    fn current_info(&self) -> LoadBalancingInfo {
        sync::read(&self.current).clone()
    }

    fn load_bundler(&self, channel_id: &str) -> GridResult<(String, Box<dyn Bundler>)> {
        let info = self.current_info();
        let mut bundler = self.new_bundler(&info)?;
        if let Some(persistence) = &self.persistence {
            match persistence.load(channel_id, &info.algorithm) {
                Ok(Some(state)) => {
                    debug!("通道 {} 恢复负载均衡器状态", channel_id);
                    bundler.restore(&state);
                }
                Ok(None) => {}
                Err(e) => warn!("加载通道 {} 的负载均衡器状态失败: {}", channel_id, e),
            }
        }
        Ok((info.algorithm, bundler))
    }

    fn last_update_time(&self) -> u64 {
        self.last_update.load(Ordering::Acquire)
    }

    fn fallback_bundler(&self) -> Box<dyn Bundler> {
        Box::new(ManualBundler::new(1))
    }

    fn store_bundler(&self, channel_id: &str, algorithm: &str, bundler: &dyn Bundler) {
        let (Some(persistence), Some(state)) = (&self.persistence, bundler.snapshot()) else {
            return;
        };
        if let Err(e) = persistence.store(channel_id, algorithm, state) {
            warn!("保存通道 {} 的负载均衡器状态失败: {}", channel_id, e);
        }
    }
}

fn validate_info(info: &LoadBalancingInfo) -> GridResult<()> {
    if !SUPPORTED_ALGORITHMS.contains(&info.algorithm.as_str()) {
        return Err(GridError::LoadBalancer(format!(
            "无效的负载均衡算法: {}，支持的算法: {:?}",
            info.algorithm, SUPPORTED_ALGORITHMS
        )));
    }
    Ok(())
}
