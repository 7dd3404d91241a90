use serde::{Deserialize, Serialize};

use crate::load_balancer::{driver_default_info, SUPPORTED_ALGORITHMS};
use crate::traits::LoadBalancingInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub local_execution_enabled: bool,
    pub local_threads: usize,
    pub local_priority: i32,
    pub local_max_jobs: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_execution_enabled: true,
            local_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            local_priority: 0,
            local_max_jobs: 1,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_threads == 0 {
            return Err(anyhow::anyhow!("本地执行线程数必须大于0"));
        }
        if self.local_max_jobs == 0 {
            return Err(anyhow::anyhow!("本地通道最大作业数必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 没有可分发的组合时的周期唤醒间隔
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub max_jobs: usize,
    pub priority: i32,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    /// 重连延迟的随机抖动比例，取值 [0, 1]
    pub reconnect_jitter: f64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            priority: 0,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 10,
            reconnect_jitter: 0.2,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_jobs == 0 {
            return Err(anyhow::anyhow!("远程通道最大作业数必须大于0"));
        }
        if self.reconnect_initial_delay_ms == 0 {
            return Err(anyhow::anyhow!("重连初始延迟必须大于0"));
        }
        if self.reconnect_max_delay_ms < self.reconnect_initial_delay_ms {
            return Err(anyhow::anyhow!("重连最大延迟不能小于初始延迟"));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(anyhow::anyhow!(
                "重连抖动比例必须在0到1之间: {}",
                self.reconnect_jitter
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub enabled: bool,
    pub nodes: usize,
    pub node_threads: usize,
    pub tick_interval_ms: u64,
    pub load_balancing: LoadBalancingInfo,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nodes: 2,
            node_threads: 2,
            tick_interval_ms: 1000,
            load_balancing: driver_default_info(),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.nodes == 0 {
            return Err(anyhow::anyhow!("驱动端节点数必须大于0"));
        }
        if self.node_threads == 0 {
            return Err(anyhow::anyhow!("节点执行线程数必须大于0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("驱动端调度间隔必须大于0"));
        }
        validate_load_balancing(&self.load_balancing)
    }
}

pub fn validate_load_balancing(info: &LoadBalancingInfo) -> anyhow::Result<()> {
    if !SUPPORTED_ALGORITHMS.contains(&info.algorithm.as_str()) {
        return Err(anyhow::anyhow!(
            "无效的负载均衡算法: {}，支持的算法: {:?}",
            info.algorithm,
            SUPPORTED_ALGORITHMS
        ));
    }
    if info.parameters.get("size").is_some() && info.usize_parameter("size").unwrap_or(0) == 0 {
        return Err(anyhow::anyhow!("任务束大小必须为正整数"));
    }
    Ok(())
}
