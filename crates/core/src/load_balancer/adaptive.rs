use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::SystemInformation;
use crate::traits::{next_stamp, Bundler};

pub const ADAPTIVE: &str = "adaptive";

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveParameters {
    pub initial_size: usize,
    pub target_duration: Duration,
    pub performance_cache_size: usize,
    pub max_size: usize,
}

impl Default for AdaptiveParameters {
    fn default() -> Self {
        Self {
            initial_size: 5,
            target_duration: Duration::from_millis(500),
            performance_cache_size: 16,
            max_size: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AdaptiveState {
    size: usize,
    mean_task_nanos: Option<f64>,
}

/// 根据每任务平均耗时的滑动窗口调整任务束大小，使一次往返接近目标时长
pub struct AdaptiveBundler {
    params: AdaptiveParameters,
    samples: VecDeque<(usize, Duration)>,
    size: usize,
    stamp: u64,
}

impl AdaptiveBundler {
    pub fn new(params: AdaptiveParameters) -> Self {
        let size = params.initial_size.clamp(1, params.max_size.max(1));
        Self {
            params,
            samples: VecDeque::new(),
            size,
            stamp: next_stamp(),
        }
    }

    fn mean_task_nanos(&self) -> Option<f64> {
        let (tasks, nanos) = self
            .samples
            .iter()
            .fold((0usize, 0u128), |(t, n), (count, elapsed)| {
                (t + count, n + elapsed.as_nanos())
            });
        (tasks > 0).then(|| nanos as f64 / tasks as f64)
    }

    fn recompute(&mut self) {
        let Some(mean) = self.mean_task_nanos() else {
            return;
        };
        let max = self.params.max_size.max(1);
        let target = self.params.target_duration.as_nanos() as f64;
        self.size = if mean <= 0.0 {
            max
        } else {
            ((target / mean).round() as usize).clamp(1, max)
        };
    }
}

impl Bundler for AdaptiveBundler {
    fn algorithm(&self) -> &str {
        ADAPTIVE
    }

    fn bundle_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, task_count: usize, elapsed: Duration) {
        if task_count == 0 {
            return;
        }
        self.samples.push_back((task_count, elapsed));
        while self.samples.len() > self.params.performance_cache_size.max(1) {
            self.samples.pop_front();
        }
        let previous = self.size;
        self.recompute();
        if previous != self.size {
            debug!("自适应负载均衡调整任务束大小: {} -> {}", previous, self.size);
        }
    }

    fn timestamp(&self) -> u64 {
        self.stamp
    }

    fn setup(&mut self, info: &SystemInformation) {
        if self.samples.is_empty() {
            if let Some(processors) = info.available_processors() {
                self.size = self.size.max(processors).min(self.params.max_size.max(1));
            }
        }
    }

    fn dispose(&mut self) {
        self.samples.clear();
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        serde_json::to_value(AdaptiveState {
            size: self.size,
            mean_task_nanos: self.mean_task_nanos(),
        })
        .ok()
    }

    fn restore(&mut self, state: &serde_json::Value) {
        if let Ok(state) = serde_json::from_value::<AdaptiveState>(state.clone()) {
            self.size = state.size.clamp(1, self.params.max_size.max(1));
            if let Some(mean) = state.mean_task_nanos {
                // 以单个样本重建窗口
                let nanos = mean.max(0.0).round() as u64;
                self.samples.push_back((1, Duration::from_nanos(nanos)));
            }
        }
    }
}
