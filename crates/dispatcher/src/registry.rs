use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use grid_core::errors::{GridError, GridResult};
use grid_core::models::ExecutorStatus;
use grid_core::sync;
use tracing::debug;

use crate::channel::ExecutorChannel;

/// 作业管理器持有的通道注册表。
///
/// 空闲通道按优先级分组，组内按进入空闲的先后排列。状态监听器只登记
/// 刷新请求，调度器下一轮分发前统一应用，监听器因此不会与分发争锁。
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn ExecutorChannel>>>,
    idle: Mutex<BTreeMap<Reverse<i32>, VecDeque<String>>>,
    refresh: Mutex<Vec<String>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: Arc<dyn ExecutorChannel>) -> GridResult<()> {
        let uuid = channel.uuid().to_string();
        {
            let mut channels = sync::write(&self.channels);
            if channels.contains_key(&uuid) {
                return Err(GridError::Internal(format!("通道 {uuid} 已注册")));
            }
            channels.insert(uuid.clone(), channel);
        }
        self.request_refresh(&uuid);
        Ok(())
    }

    pub fn remove(&self, uuid: &str) -> Option<Arc<dyn ExecutorChannel>> {
        let removed = sync::write(&self.channels).remove(uuid);
        if removed.is_some() {
            self.request_refresh(uuid);
        }
        removed
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<dyn ExecutorChannel>> {
        sync::read(&self.channels).get(uuid).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn ExecutorChannel>> {
        sync::read(&self.channels).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        sync::read(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 登记一次空闲状态刷新，可在任意线程调用
    pub fn request_refresh(&self, uuid: &str) {
        sync::lock(&self.refresh).push(uuid.to_string());
    }

    /// 按通道当前状态重新计算空闲集合中的登记项
    pub fn apply_refresh(&self) {
        let pending: Vec<String> = std::mem::take(&mut *sync::lock(&self.refresh));
        if pending.is_empty() {
            return;
        }
        let mut idle = sync::lock(&self.idle);
        for uuid in pending {
            for list in idle.values_mut() {
                list.retain(|u| *u != uuid);
            }
            let Some(channel) = self.get(&uuid) else {
                continue;
            };
            if channel.execution_status() == ExecutorStatus::Active {
                debug!("通道 {} 进入空闲集合", uuid);
                idle.entry(Reverse(channel.priority()))
                    .or_default()
                    .push_back(uuid);
            }
        }
        idle.retain(|_, list| !list.is_empty());
    }

    /// 可工作通道中的最高优先级
    pub fn highest_working_priority(&self) -> Option<i32> {
        sync::read(&self.channels)
            .values()
            .filter(|c| c.status().is_working())
            .map(|c| c.priority())
            .max()
    }

    /// 指定优先级下当前确实空闲的通道，按进入空闲的先后排列
    pub fn idle_channels(&self, priority: i32) -> Vec<Arc<dyn ExecutorChannel>> {
        let uuids: Vec<String> = sync::lock(&self.idle)
            .get(&Reverse(priority))
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default();
        uuids
            .iter()
            .filter_map(|uuid| self.get(uuid))
            .filter(|c| c.execution_status() == ExecutorStatus::Active)
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        sync::lock(&self.idle).values().map(VecDeque::len).sum()
    }
}
