use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use grid_core::errors::{GridError, GridResult};
use grid_core::models::{ExecutorStatus, TaskError};
use grid_core::sync;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::ExecutorChannel;
use crate::job::{ClientJob, ClientTaskBundle};
use crate::metrics;

#[derive(Default)]
struct QueueState {
    /// 优先级从高到低，同一优先级内先进先出
    priority_map: BTreeMap<Reverse<i32>, VecDeque<Arc<ClientJob>>>,
    job_map: HashMap<Uuid, Arc<ClientJob>>,
}

impl QueueState {
    fn contains_queued(&self, job: &ClientJob) -> bool {
        self.priority_map
            .get(&Reverse(job.priority()))
            .is_some_and(|list| list.iter().any(|j| j.uuid() == job.uuid()))
    }

    fn remove_queued(&mut self, uuid: Uuid, priority: i32) -> bool {
        let key = Reverse(priority);
        let Some(list) = self.priority_map.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|j| j.uuid() != uuid);
        let removed = list.len() != before;
        if list.is_empty() {
            self.priority_map.remove(&key);
        }
        removed
    }

    fn push_queued(&mut self, job: Arc<ClientJob>) {
        self.priority_map
            .entry(Reverse(job.priority()))
            .or_default()
            .push_back(job);
    }

    fn queued_len(&self) -> usize {
        self.priority_map.values().map(VecDeque::len).sum()
    }
}

/// 客户端作业优先级队列
pub struct JobQueue {
    state: Mutex<QueueState>,
    pending_broadcasts: Mutex<Vec<Arc<ClientJob>>>,
    wakeup: Arc<Notify>,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(wakeup: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            pending_broadcasts: Mutex::new(Vec::new()),
            wakeup,
            closed: AtomicBool::new(false),
        })
    }

    /// 入队；广播作业按 `channels` 中可用的远程通道展开
    pub fn add_job(
        self: &Arc<Self>,
        job: Arc<ClientJob>,
        channels: &[Arc<dyn ExecutorChannel>],
    ) -> GridResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GridError::ManagerClosed);
        }
        self.prepare(&job)?;
        self.schedule_timers(&job);
        if job.is_broadcast_parent() {
            self.process_broadcast(&job, channels);
        } else {
            self.insert(job);
        }
        Ok(())
    }

    /// 重复 uuid 拒绝入队；作业结束时从队列中移除，有任务退回时重新入队
    fn prepare(self: &Arc<Self>, job: &Arc<ClientJob>) -> GridResult<()> {
        {
            let mut state = sync::lock(&self.state);
            if state.job_map.contains_key(&job.uuid()) {
                return Err(GridError::JobAlreadyQueued { uuid: job.uuid() });
            }
            state.job_map.insert(job.uuid(), Arc::clone(job));
        }
        let queue = Arc::downgrade(self);
        let uuid = job.uuid();
        job.add_on_done(move || {
            if let Some(queue) = queue.upgrade() {
                queue.remove_job(uuid);
            }
        });
        let queue = Arc::downgrade(self);
        let weak = Arc::downgrade(job);
        job.set_on_requeue(Arc::new(move || {
            if let (Some(queue), Some(job)) = (queue.upgrade(), weak.upgrade()) {
                queue.requeue(&job);
            }
        }));
        job.mark_queued();
        Ok(())
    }

    fn insert(&self, job: Arc<ClientJob>) {
        debug!("作业 {} 入队，优先级 {}", job.name(), job.priority());
        let size = {
            let mut state = sync::lock(&self.state);
            state.push_queued(Arc::clone(&job));
            state.queued_len()
        };
        metrics::queue_size(size);
        job.complete_if_empty();
        self.wakeup.notify_one();
    }

    fn schedule_timers(&self, job: &Arc<ClientJob>) {
        let sla = job.sla();
        if sla.job_start_delay.is_none() && sla.job_expiration.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("没有可用的异步运行时，忽略作业 {} 的调度计划", job.name());
            return;
        };
        if let Some(delay) = sla.job_start_delay {
            job.set_pending(true);
            let weak = Arc::downgrade(job);
            let wakeup = Arc::clone(&self.wakeup);
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(job) = weak.upgrade() {
                    debug!("作业 {} 到达启动时间", job.name());
                    job.set_pending(false);
                    wakeup.notify_one();
                }
            });
        }
        if let Some(timeout) = sla.job_expiration {
            let weak: Weak<ClientJob> = Arc::downgrade(job);
            runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(job) = weak.upgrade() {
                    if !job.is_ended() {
                        job.job_expired();
                    }
                }
            });
        }
    }

    /// 没有可工作的远程通道时挂起等待；有通道但都不满足执行策略时作业立即结束
    fn process_broadcast(self: &Arc<Self>, job: &Arc<ClientJob>, channels: &[Arc<dyn ExecutorChannel>]) {
        let mut seen = HashSet::new();
        let working: Vec<&Arc<dyn ExecutorChannel>> = channels
            .iter()
            .filter(|c| !c.is_local())
            .filter(|c| {
                matches!(
                    c.execution_status(),
                    ExecutorStatus::Active | ExecutorStatus::Executing
                )
            })
            .filter(|c| seen.insert(c.uuid().to_string()))
            .collect();

        if working.is_empty() {
            info!("没有可用于广播作业 {} 的通道，等待通道连接", job.name());
            sync::lock(&self.pending_broadcasts).push(Arc::clone(job));
            return;
        }

        let targets: Vec<(String, String)> = working
            .into_iter()
            .filter(|c| match &job.sla().execution_policy {
                Some(policy) => policy.accepts(&c.system_information()),
                None => true,
            })
            .map(|c| (c.uuid().to_string(), c.management_info().host))
            .collect();

        if targets.is_empty() {
            info!("没有通道满足广播作业 {} 的执行策略，作业直接结束", job.name());
            job.complete_without_targets();
            return;
        }

        let children = job.create_broadcast_children(&targets);
        for child in children {
            if let Err(e) = self.prepare(&child) {
                warn!("广播子作业 {} 入队失败: {}", child.name(), e);
                continue;
            }
            self.insert(child);
        }
    }

    /// 有可用通道后展开等待中的广播作业
    pub fn process_pending_broadcasts(self: &Arc<Self>, channels: &[Arc<dyn ExecutorChannel>]) {
        let parked: Vec<Arc<ClientJob>> = {
            let mut pending = sync::lock(&self.pending_broadcasts);
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        for job in parked {
            if job.is_ended() || job.is_cancelled() {
                continue;
            }
            self.process_broadcast(&job, channels);
        }
    }

    /// 重新放回优先级队列；已在队列中时不重复插入
    pub fn requeue(&self, job: &Arc<ClientJob>) {
        {
            let mut state = sync::lock(&self.state);
            if !state.job_map.contains_key(&job.uuid()) {
                warn!("作业 {} 不在队列管理中，无法重新入队", job.name());
                return;
            }
            if !state.contains_queued(job) {
                debug!("作业 {} 重新入队", job.name());
                state.push_queued(Arc::clone(job));
            }
        }
        self.wakeup.notify_one();
    }

    /// 为 `channel_uuid` 从作业切出最多 `max_tasks` 个任务。
    ///
    /// 作业带依赖图时整体发送；任务全部切出后作业离开队列，
    /// 有任务退回时经入队时注册的回调回到队列。
    pub fn next_bundle(
        self: &Arc<Self>,
        job: &Arc<ClientJob>,
        max_tasks: usize,
        channel_uuid: &str,
    ) -> Option<Arc<ClientTaskBundle>> {
        let mut state = sync::lock(&self.state);
        let available = job.pending_task_count();
        if available == 0 {
            state.remove_queued(job.uuid(), job.priority());
            return None;
        }
        let effective = if job.task_graph().is_some() {
            available
        } else {
            max_tasks.max(1)
        };
        let bundle = job.next_bundle(effective, channel_uuid)?;
        state.remove_queued(job.uuid(), job.priority());
        if job.pending_task_count() > 0 {
            state.push_queued(Arc::clone(job));
        }
        metrics::queue_size(state.queued_len());
        Some(bundle)
    }

    /// 按优先级与入队顺序排列的快照
    pub fn jobs_in_order(&self) -> Vec<Arc<ClientJob>> {
        sync::lock(&self.state)
            .priority_map
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    pub fn job(&self, uuid: Uuid) -> Option<Arc<ClientJob>> {
        sync::lock(&self.state).job_map.get(&uuid).cloned()
    }

    pub fn cancel_job(&self, uuid: Uuid) -> bool {
        match self.job(uuid) {
            Some(job) => job.cancel(true),
            None => false,
        }
    }

    pub fn update_priority(&self, uuid: Uuid, priority: i32) -> bool {
        {
            let mut state = sync::lock(&self.state);
            let Some(job) = state.job_map.get(&uuid).cloned() else {
                return false;
            };
            let old = job.priority();
            if old == priority {
                return true;
            }
            let was_queued = state.remove_queued(uuid, old);
            job.set_priority(priority);
            if was_queued {
                state.push_queued(job);
            }
            info!("作业 {} 优先级调整: {} -> {}", uuid, old, priority);
        }
        self.wakeup.notify_one();
        true
    }

    /// 通道断开：绑定该通道的广播子作业以剩余任务失败的方式强制完成
    pub fn cancel_broadcast_jobs(&self, channel_uuid: &str) {
        let bound: Vec<Arc<ClientJob>> = sync::lock(&self.state)
            .job_map
            .values()
            .filter(|job| job.broadcast_channel() == Some(channel_uuid))
            .cloned()
            .collect();
        for job in bound {
            job.force_complete(TaskError::channel_failure(format!(
                "广播目标通道 {} 已断开",
                channel_uuid
            )));
        }
    }

    /// 从所有映射中移除作业
    pub fn remove_job(&self, uuid: Uuid) {
        let size = {
            let mut state = sync::lock(&self.state);
            if let Some(job) = state.job_map.remove(&uuid) {
                state.remove_queued(uuid, job.priority());
            }
            state.queued_len()
        };
        sync::lock(&self.pending_broadcasts).retain(|job| job.uuid() != uuid);
        metrics::queue_size(size);
    }

    /// 排队中的作业数
    pub fn len(&self) -> usize {
        sync::lock(&self.state).queued_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 队列管理的全部作业数，包括已全部切出的作业
    pub fn job_count(&self) -> usize {
        sync::lock(&self.state).job_map.len()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let jobs: Vec<Arc<ClientJob>> = sync::lock(&self.state).job_map.values().cloned().collect();
        info!("关闭作业队列，取消 {} 个作业", jobs.len());
        for job in jobs {
            if job.parent().is_none() {
                job.cancel(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use grid_core::models::Job;
    use grid_core::traits::JobNotifier;

    use super::*;

    fn queued_job(queue: &Arc<JobQueue>, tasks: usize) -> Arc<ClientJob> {
        let job = ClientJob::new(
            Job::new("requeue").with_tasks((0..tasks).map(|i| vec![i as u8])),
            Arc::new(JobNotifier::new()),
        );
        queue.add_job(Arc::clone(&job), &[]).unwrap();
        job
    }

    #[test]
    fn test_tasks_returned_after_drain_requeue_job() {
        let queue = JobQueue::new(Arc::new(Notify::new()));
        let job = queued_job(&queue, 4);
        assert_eq!(queue.len(), 1);

        // 作业在队列之外被切空
        let bundle = job.next_bundle(4, "c1").unwrap();
        assert!(queue.next_bundle(&job, 4, "c1").is_none());
        assert_eq!(queue.len(), 0);

        job.task_completed(bundle.id(), Vec::new(), None);
        assert_eq!(job.pending_task_count(), 4);
        assert_eq!(queue.len(), 1);
        assert!(Arc::ptr_eq(&queue.jobs_in_order()[0], &job));
    }

    #[test]
    fn test_requeue_does_not_duplicate_queued_job() {
        let queue = JobQueue::new(Arc::new(Notify::new()));
        let job = queued_job(&queue, 4);

        let first = queue.next_bundle(&job, 2, "c1").unwrap();
        assert_eq!(queue.len(), 1);
        let second = queue.next_bundle(&job, 2, "c2").unwrap();
        assert_eq!(queue.len(), 0);

        job.task_completed(first.id(), Vec::new(), None);
        job.task_completed(second.id(), Vec::new(), None);
        assert_eq!(job.pending_task_count(), 4);
        assert_eq!(queue.len(), 1);
    }
}
