use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use grid_core::models::{BundleHeader, BundleMessage, Task};
use grid_core::sync;
use tracing::debug;

use crate::send_strategy::{strategy_for, SendStrategy};

/// 接收驱动端转发的结果，通常由连接客户端的传输层实现
pub trait ClientBundleListener: Send + Sync {
    fn results_available(&self, bundle_id: u64, tasks: Vec<Task>);

    fn bundle_completed(&self, _bundle_id: u64) {}
}

#[derive(Default)]
struct ClientBundleState {
    tasks: Vec<Task>,
    buffered: Vec<Task>,
    received: BTreeSet<usize>,
}

/// 客户端提交到驱动端的一个任务束，可独立完成
pub struct ServerTaskBundleClient {
    bundle_id: u64,
    header: BundleHeader,
    positions: BTreeSet<usize>,
    state: Mutex<ClientBundleState>,
    pending: AtomicUsize,
    ended: AtomicBool,
    strategy: Box<dyn SendStrategy>,
    listener: Arc<dyn ClientBundleListener>,
}

impl ServerTaskBundleClient {
    pub fn new(message: BundleMessage, listener: Arc<dyn ClientBundleListener>) -> Self {
        let BundleMessage { header, tasks } = message;
        let positions: BTreeSet<usize> = tasks.iter().map(Task::position).collect();
        let strategy = strategy_for(&header.sla.results_strategy);
        Self {
            bundle_id: header.bundle_id,
            pending: AtomicUsize::new(positions.len()),
            positions,
            header,
            state: Mutex::new(ClientBundleState {
                tasks,
                ..ClientBundleState::default()
            }),
            ended: AtomicBool::new(false),
            strategy,
            listener,
        }
    }

    pub fn bundle_id(&self) -> u64 {
        self.bundle_id
    }

    pub fn header(&self) -> &BundleHeader {
        &self.header
    }

    pub fn positions(&self) -> &BTreeSet<usize> {
        &self.positions
    }

    pub fn contains(&self, position: usize) -> bool {
        self.positions.contains(&position)
    }

    pub fn task_count(&self) -> usize {
        self.positions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// 取出初始任务，只能取一次
    pub(crate) fn take_tasks(&self) -> Vec<Task> {
        std::mem::take(&mut sync::lock(&self.state).tasks)
    }

    /// 合并终态任务，按发送策略决定是否转发；返回接受的数量
    pub fn results_received(&self, tasks: Vec<Task>) -> usize {
        if self.is_ended() {
            return 0;
        }
        let (batch, accepted, complete) = {
            let mut state = sync::lock(&self.state);
            let mut accepted = 0;
            for task in tasks {
                let position = task.position();
                if !task.is_done() || !self.positions.contains(&position) {
                    continue;
                }
                if !state.received.insert(position) {
                    continue;
                }
                state.buffered.push(task);
                accepted += 1;
            }
            let remaining = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(accepted))
                })
                .unwrap_or(0)
                .saturating_sub(accepted);
            let complete = remaining == 0;
            let batch = if self.strategy.should_send(state.buffered.len(), complete) {
                std::mem::take(&mut state.buffered)
            } else {
                Vec::new()
            };
            (batch, accepted, complete)
        };
        if !batch.is_empty() {
            debug!(
                "客户端任务束 {} 转发 {} 个结果 ({})",
                self.bundle_id,
                batch.len(),
                self.strategy.name()
            );
            self.listener.results_available(self.bundle_id, batch);
        }
        if complete
            && self
                .ended
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.listener.bundle_completed(self.bundle_id);
        }
        accepted
    }
}

impl std::fmt::Debug for ServerTaskBundleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTaskBundleClient")
            .field("bundle_id", &self.bundle_id)
            .field("job", &self.header.job_name)
            .field("tasks", &self.positions.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}
