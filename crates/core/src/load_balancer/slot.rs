use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, error};

use crate::models::SystemInformation;
use crate::sync;
use crate::traits::{Bundler, BundlerFactory};

struct Installed {
    algorithm: String,
    bundler: Box<dyn Bundler>,
}

/// 通道持有的负载均衡器；工厂配置更新后在通道锁内整体替换
#[derive(Default)]
pub struct BundlerSlot {
    inner: Mutex<Option<Installed>>,
}

impl BundlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 负载均衡器缺失或版本戳早于工厂的最后更新时间时重建
    pub fn check(&self, factory: &dyn BundlerFactory, channel_id: &str, info: &SystemInformation) {
        let mut inner = sync::lock(&self.inner);
        let stale = inner
            .as_ref()
            .map_or(true, |installed| installed.bundler.timestamp() < factory.last_update_time());
        if !stale {
            return;
        }
        if let Some(mut old) = inner.take() {
            old.bundler.dispose();
        }
        let (algorithm, mut bundler) = match factory.load_bundler(channel_id) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("通道 {} 创建负载均衡器失败，使用后备负载均衡器: {}", channel_id, e);
                let fallback = factory.fallback_bundler();
                (fallback.algorithm().to_string(), fallback)
            }
        };
        bundler.setup(info);
        debug!(
            "通道 {} 安装负载均衡器 {} (大小: {})",
            channel_id,
            algorithm,
            bundler.bundle_size()
        );
        *inner = Some(Installed { algorithm, bundler });
    }

    pub fn bundle_size(&self) -> Option<usize> {
        sync::lock(&self.inner)
            .as_ref()
            .map(|installed| installed.bundler.bundle_size())
    }

    pub fn algorithm(&self) -> Option<String> {
        sync::lock(&self.inner)
            .as_ref()
            .map(|installed| installed.algorithm.clone())
    }

    pub fn timestamp(&self) -> Option<u64> {
        sync::lock(&self.inner)
            .as_ref()
            .map(|installed| installed.bundler.timestamp())
    }

    /// 反馈一次往返，并尽力持久化新状态
    pub fn feedback(
        &self,
        factory: Option<&dyn BundlerFactory>,
        channel_id: &str,
        task_count: usize,
        elapsed: Duration,
    ) {
        let mut inner = sync::lock(&self.inner);
        if let Some(installed) = inner.as_mut() {
            installed.bundler.feedback(task_count, elapsed);
            if let Some(factory) = factory {
                factory.store_bundler(channel_id, &installed.algorithm, installed.bundler.as_ref());
            }
        }
    }

    pub fn dispose(&self) {
        if let Some(mut installed) = sync::lock(&self.inner).take() {
            installed.bundler.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::load_balancer::{client_default_info, InMemoryBundlerPersistence, LoadBalancerFactory};
    use crate::traits::{BundlerFactory, LoadBalancingInfo};

    #[test]
    fn test_reload_after_configuration_change() {
        let factory = LoadBalancerFactory::new(client_default_info()).unwrap();
        let slot = BundlerSlot::new();
        let info = SystemInformation::new();

        slot.check(&factory, "c1", &info);
        let first = slot.timestamp().unwrap();
        slot.check(&factory, "c1", &info);
        assert_eq!(slot.timestamp(), Some(first));

        factory
            .update_configuration(LoadBalancingInfo::new("manual").with_parameter("size", 7u64))
            .unwrap();
        slot.check(&factory, "c1", &info);
        assert!(slot.timestamp().unwrap() > first);
        assert_eq!(slot.bundle_size(), Some(7));
    }

    #[test]
    fn test_feedback_persists_state() {
        let persistence = Arc::new(InMemoryBundlerPersistence::new());
        let factory = LoadBalancerFactory::new(LoadBalancingInfo::new("adaptive"))
            .unwrap()
            .with_persistence(persistence.clone());
        let slot = BundlerSlot::new();
        slot.check(&factory, "c1", &SystemInformation::new());
        slot.feedback(Some(&factory as &dyn BundlerFactory), "c1", 10, Duration::from_millis(50));
        assert_eq!(persistence.len(), 1);

        // 重建时恢复已保存的大小
        let expected = slot.bundle_size();
        factory
            .update_configuration(LoadBalancingInfo::new("adaptive"))
            .unwrap();
        slot.check(&factory, "c1", &SystemInformation::new());
        assert_eq!(slot.bundle_size(), expected);
    }
}
