use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use grid_core::errors::GridError;
use grid_core::models::{
    BundleHeader, BundleMessage, RejectedTask, Task, TaskError, TaskState,
};
use grid_core::sync;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::client_job::ClientJob;

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// 一次往返分发给单个通道的任务切片。
///
/// 持有所属作业的弱引用；位置集合在创建时确定，之后不会增加。
pub struct ClientTaskBundle {
    id: u64,
    job: Weak<ClientJob>,
    job_uuid: Uuid,
    channel_uuid: String,
    header: BundleHeader,
    positions: Vec<usize>,
    /// 尚未返回的任务
    outstanding: Mutex<BTreeMap<usize, Task>>,
    pending: AtomicUsize,
    cancel: CancellationToken,
    completion: CancellationToken,
    requeued: AtomicBool,
    cancelled: AtomicBool,
    ended: AtomicBool,
    created: Instant,
}

impl ClientTaskBundle {
    pub(crate) fn new(job: &Arc<ClientJob>, channel_uuid: &str, tasks: Vec<Task>) -> Self {
        let id = NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed);
        let header = BundleHeader {
            job_uuid: job.uuid(),
            job_name: job.name().to_string(),
            bundle_id: id,
            sla: job.sla().clone(),
            metadata: job.metadata().clone(),
            job_task_count: job.task_count(),
            task_graph: job.task_graph().cloned(),
        };
        let positions: Vec<usize> = tasks.iter().map(Task::position).collect();
        let pending = AtomicUsize::new(tasks.len());
        Self {
            id,
            job: Arc::downgrade(job),
            job_uuid: job.uuid(),
            channel_uuid: channel_uuid.to_string(),
            header,
            positions,
            outstanding: Mutex::new(tasks.into_iter().map(|t| (t.position(), t)).collect()),
            pending,
            cancel: CancellationToken::new(),
            completion: CancellationToken::new(),
            requeued: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job(&self) -> Option<Arc<ClientJob>> {
        self.job.upgrade()
    }

    pub fn job_uuid(&self) -> Uuid {
        self.job_uuid
    }

    pub fn channel_uuid(&self) -> &str {
        &self.channel_uuid
    }

    pub fn header(&self) -> &BundleHeader {
        &self.header
    }

    pub fn positions(&self) -> Vec<usize> {
        self.positions.clone()
    }

    pub fn task_count(&self) -> usize {
        self.positions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn tasks_snapshot(&self) -> Vec<Task> {
        sync::lock(&self.outstanding).values().cloned().collect()
    }

    pub fn to_message(&self) -> BundleMessage {
        BundleMessage {
            header: self.header.clone(),
            tasks: self.tasks_snapshot(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 任务束结束时触发
    pub fn completion_token(&self) -> CancellationToken {
        self.completion.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    pub fn is_requeued(&self) -> bool {
        self.requeued.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn job_dispatched(&self) {
        if let Some(job) = self.job() {
            job.job_dispatched(self.id, &self.channel_uuid);
        }
    }

    /// 接收一批（可能是部分）结果，返回属于本任务束的已完成任务数；
    /// 待完成计数归零时结束任务束
    pub fn results_received(&self, results: Vec<Task>) -> usize {
        if self.is_ended() {
            return 0;
        }
        let accepted: Vec<Task> = {
            let mut outstanding = sync::lock(&self.outstanding);
            results
                .into_iter()
                .filter(|task| task.is_done() || task.state() == TaskState::Resubmit)
                .filter(|task| outstanding.remove(&task.position()).is_some())
                .collect()
        };
        let count = accepted.len();
        if count == 0 {
            return 0;
        }
        let remaining = self.decrement_pending(count);
        if let Some(job) = self.job() {
            job.results_received(self.id, accepted);
        }
        if remaining == 0 {
            self.complete(None);
        }
        count
    }

    /// 整个任务束以同一错误失败，例如结果无法反序列化
    pub fn results_error(&self, error: TaskError) -> usize {
        let failed: Vec<Task> = sync::lock(&self.outstanding)
            .values()
            .cloned()
            .map(|mut task| {
                task.exception_received(error.clone());
                task
            })
            .collect();
        self.results_received(failed)
    }

    /// 对端拒收的任务立即以 EXCEPTION 返回，其余任务不受影响
    pub fn reject(&self, rejected: &[RejectedTask]) -> usize {
        let failed: Vec<Task> = {
            let outstanding = sync::lock(&self.outstanding);
            rejected
                .iter()
                .filter_map(|r| {
                    outstanding.get(&r.position).cloned().map(|mut task| {
                        task.exception_received(TaskError::new(r.kind, r.reason.clone()));
                        task
                    })
                })
                .collect()
        };
        self.results_received(failed)
    }

    /// 通道故障：未返回的任务标记为 RESUBMIT，由 `complete` 交还作业
    pub fn resubmit(&self) {
        if self.is_ended() {
            return;
        }
        self.requeued.store(true, Ordering::Release);
        for task in sync::lock(&self.outstanding).values_mut() {
            task.mark_resubmit();
        }
    }

    /// 分发超时：递增每个未返回任务的超时计数，超过上限的任务取消，其余重新提交
    pub fn expire(&self, max_expirations: u32) {
        if self.is_ended() {
            return;
        }
        debug!("任务束 {} 分发超时", self.id);
        let given_up: Vec<Task> = {
            let mut outstanding = sync::lock(&self.outstanding);
            let mut given_up = Vec::new();
            for task in outstanding.values_mut() {
                if task.increment_expiration() > max_expirations {
                    task.cancel();
                    given_up.push(task.clone());
                } else {
                    task.mark_resubmit();
                }
            }
            given_up
        };
        self.requeued.store(true, Ordering::Release);
        self.cancel.cancel();
        if !given_up.is_empty() {
            self.results_received(given_up);
        }
        self.complete(None);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// 结束任务束，只有第一次调用生效
    pub fn complete(&self, error: Option<&GridError>) -> bool {
        if self
            .ended
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let unreturned: Vec<Task> = std::mem::take(&mut *sync::lock(&self.outstanding))
            .into_values()
            .collect();
        if let Some(job) = self.job() {
            job.task_completed(self.id, unreturned, error);
            job.remove_channel(&self.channel_uuid);
        }
        self.completion.cancel();
        true
    }

    fn decrement_pending(&self, count: usize) -> usize {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            })
            .unwrap_or(0);
        previous.saturating_sub(count)
    }
}

impl std::fmt::Debug for ClientTaskBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTaskBundle")
            .field("id", &self.id)
            .field("job", &self.header.job_name)
            .field("channel", &self.channel_uuid)
            .field("tasks", &self.positions.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}
