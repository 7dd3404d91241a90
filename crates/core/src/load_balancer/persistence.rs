use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::GridResult;
use crate::sync;
use crate::traits::BundlerPersistence;

/// 进程内的负载均衡器状态存储，按 (通道, 算法) 区分
#[derive(Default)]
pub struct InMemoryBundlerPersistence {
    states: Mutex<HashMap<(String, String), serde_json::Value>>,
}

impl InMemoryBundlerPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.states).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BundlerPersistence for InMemoryBundlerPersistence {
    fn load(&self, channel_id: &str, algorithm: &str) -> GridResult<Option<serde_json::Value>> {
        Ok(sync::lock(&self.states)
            .get(&(channel_id.to_string(), algorithm.to_string()))
            .cloned())
    }

    fn store(&self, channel_id: &str, algorithm: &str, state: serde_json::Value) -> GridResult<()> {
        sync::lock(&self.states).insert((channel_id.to_string(), algorithm.to_string()), state);
        Ok(())
    }
}
