use grid_core::models::ResultsStrategy;

/// 决定客户端任务束的缓冲结果何时转发给提交者
pub trait SendStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_send(&self, buffered: usize, bundle_complete: bool) -> bool;
}

/// 每批节点结果到达即转发
pub struct NodeResults;

impl SendStrategy for NodeResults {
    fn name(&self) -> &'static str {
        "node_results"
    }

    fn should_send(&self, buffered: usize, bundle_complete: bool) -> bool {
        buffered > 0 || bundle_complete
    }
}

/// 整个客户端任务束完成后一次性转发
pub struct AllResults;

impl SendStrategy for AllResults {
    fn name(&self) -> &'static str {
        "all_results"
    }

    fn should_send(&self, _buffered: usize, bundle_complete: bool) -> bool {
        bundle_complete
    }
}

/// 缓冲达到 n 个结果或任务束完成时转发
pub struct NTasks {
    count: usize,
}

impl NTasks {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
        }
    }
}

impl SendStrategy for NTasks {
    fn name(&self) -> &'static str {
        "n_tasks"
    }

    fn should_send(&self, buffered: usize, bundle_complete: bool) -> bool {
        buffered >= self.count || bundle_complete
    }
}

pub fn strategy_for(strategy: &ResultsStrategy) -> Box<dyn SendStrategy> {
    match strategy {
        ResultsStrategy::NodeResults => Box::new(NodeResults),
        ResultsStrategy::AllResults => Box::new(AllResults),
        ResultsStrategy::NTasks { count } => Box::new(NTasks::new(*count)),
    }
}
