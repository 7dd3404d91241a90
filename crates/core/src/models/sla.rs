use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::ExecutionPolicy;
use super::task::ResubmitExhaustedPolicy;

/// 结果回传策略：按批转发、整体完成后转发或累积到N个再转发
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultsStrategy {
    #[default]
    NodeResults,
    AllResults,
    NTasks { count: usize },
}

/// 作业的调度约束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSla {
    pub priority: i32,
    /// 同时服务该作业的最大通道数
    pub max_channels: usize,
    pub broadcast: bool,
    pub allow_multiple_dispatches_to_same_channel: bool,
    pub execution_policy: Option<ExecutionPolicy>,
    /// 按顺序尝试的偏好策略，首个命中的策略决定候选通道
    pub preference: Vec<ExecutionPolicy>,
    pub max_task_resubmits: u32,
    pub resubmit_exhausted: ResubmitExhaustedPolicy,
    pub max_dispatch_size: usize,
    pub dispatch_expiration: Option<Duration>,
    pub max_dispatch_expirations: u32,
    pub job_expiration: Option<Duration>,
    pub job_start_delay: Option<Duration>,
    pub results_strategy: ResultsStrategy,
}

impl Default for JobSla {
    fn default() -> Self {
        Self {
            priority: 0,
            max_channels: usize::MAX,
            broadcast: false,
            allow_multiple_dispatches_to_same_channel: false,
            execution_policy: None,
            preference: Vec::new(),
            max_task_resubmits: 1,
            resubmit_exhausted: ResubmitExhaustedPolicy::Fail,
            max_dispatch_size: usize::MAX,
            dispatch_expiration: None,
            max_dispatch_expirations: 0,
            job_expiration: None,
            job_start_delay: None,
            results_strategy: ResultsStrategy::NodeResults,
        }
    }
}

impl JobSla {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    pub fn allow_multiple_dispatches(mut self, allow: bool) -> Self {
        self.allow_multiple_dispatches_to_same_channel = allow;
        self
    }

    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = Some(policy);
        self
    }

    pub fn with_preference(mut self, policies: Vec<ExecutionPolicy>) -> Self {
        self.preference = policies;
        self
    }

    pub fn with_max_task_resubmits(mut self, max: u32) -> Self {
        self.max_task_resubmits = max;
        self
    }

    pub fn with_resubmit_exhausted(mut self, policy: ResubmitExhaustedPolicy) -> Self {
        self.resubmit_exhausted = policy;
        self
    }

    pub fn with_max_dispatch_size(mut self, size: usize) -> Self {
        self.max_dispatch_size = size;
        self
    }

    pub fn with_dispatch_expiration(mut self, timeout: Duration, max_expirations: u32) -> Self {
        self.dispatch_expiration = Some(timeout);
        self.max_dispatch_expirations = max_expirations;
        self
    }

    pub fn with_job_expiration(mut self, timeout: Duration) -> Self {
        self.job_expiration = Some(timeout);
        self
    }

    pub fn with_job_start_delay(mut self, delay: Duration) -> Self {
        self.job_start_delay = Some(delay);
        self
    }

    pub fn with_results_strategy(mut self, strategy: ResultsStrategy) -> Self {
        self.results_strategy = strategy;
        self
    }
}
