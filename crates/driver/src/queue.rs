use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use grid_core::errors::{GridError, GridResult};
use grid_core::models::{BundleHeader, BundleMessage, RejectedTask, SendAck, TaskError, TaskErrorKind};
use grid_core::sync;
use grid_core::traits::JobNotifier;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bundle_client::{ClientBundleListener, ServerTaskBundleClient};
use crate::bundle_node::ServerTaskBundleNode;
use crate::job::{BroadcastTarget, ServerJob};
use crate::metrics;

#[derive(Default)]
struct DriverQueueState {
    priority_map: BTreeMap<Reverse<i32>, VecDeque<Arc<ServerJob>>>,
    jobs: HashMap<Uuid, Arc<ServerJob>>,
}

impl DriverQueueState {
    fn is_queued(&self, job: &Arc<ServerJob>) -> bool {
        self.priority_map
            .get(&Reverse(job.priority()))
            .is_some_and(|list| list.iter().any(|j| Arc::ptr_eq(j, job)))
    }

    fn push(&mut self, job: Arc<ServerJob>) {
        self.priority_map
            .entry(Reverse(job.priority()))
            .or_default()
            .push_back(job);
    }

    fn unqueue(&mut self, job: &Arc<ServerJob>, priority: i32) -> bool {
        let key = Reverse(priority);
        let Some(list) = self.priority_map.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|j| !Arc::ptr_eq(j, job));
        let removed = list.len() != before;
        if list.is_empty() {
            self.priority_map.remove(&key);
        }
        removed
    }

    fn queued_len(&self) -> usize {
        self.priority_map.values().map(VecDeque::len).sum()
    }
}

/// 驱动端作业队列：按作业 uuid 合并客户端任务束，按优先级排列待分发作业
pub struct DriverQueue {
    state: Mutex<DriverQueueState>,
    notifier: Arc<JobNotifier>,
    wakeup: Arc<Notify>,
    closed: AtomicBool,
}

impl DriverQueue {
    pub fn new(notifier: Arc<JobNotifier>, wakeup: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DriverQueueState::default()),
            notifier,
            wakeup,
            closed: AtomicBool::new(false),
        })
    }

    /// 接收客户端任务束。
    ///
    /// 目标作业已经结束时，旧作业退出队列并以同一 uuid 创建新作业；
    /// 位置重复的任务束整体拒收。
    pub fn add_bundle(
        self: &Arc<Self>,
        message: BundleMessage,
        listener: Arc<dyn ClientBundleListener>,
    ) -> GridResult<SendAck> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GridError::ManagerClosed);
        }
        let header = message.header.clone();
        let bundle = Arc::new(ServerTaskBundleClient::new(message, listener));
        let mut retried = false;
        loop {
            let job = self.job_for(&header);
            match job.add_bundle(Arc::clone(&bundle)) {
                Ok(_) => {
                    metrics::bundle_received(bundle.task_count());
                    self.enqueue(&job);
                    job.check_completion();
                    return Ok(SendAck::accepted());
                }
                Err(GridError::JobAlreadyEnded { uuid }) if !retried => {
                    warn!("作业 {} 已结束，为迟到的任务束 {} 创建新作业", uuid, header.bundle_id);
                    self.retire(&job);
                    retried = true;
                }
                Err(GridError::DuplicateTaskPosition { job: uuid, position }) => {
                    error!(
                        "拒收作业 {} 的任务束 {}: 位置 {} 重复",
                        uuid, header.bundle_id, position
                    );
                    let reason = format!("作业 {uuid} 的任务位置 {position} 重复");
                    let rejected = bundle
                        .positions()
                        .iter()
                        .map(|&p| RejectedTask::new(p, TaskErrorKind::Rejected, reason.clone()))
                        .collect();
                    metrics::bundle_rejected();
                    return Ok(SendAck { rejected });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn job_for(self: &Arc<Self>, header: &BundleHeader) -> Arc<ServerJob> {
        let mut state = sync::lock(&self.state);
        if let Some(job) = state.jobs.get(&header.job_uuid) {
            return Arc::clone(job);
        }
        let job = ServerJob::new(header.clone(), Arc::clone(&self.notifier));
        self.register(&job);
        debug!("创建驱动端作业 {} ({})", header.job_name, header.job_uuid);
        state.jobs.insert(header.job_uuid, Arc::clone(&job));
        metrics::job_count(state.jobs.len());
        job
    }

    /// 结束时移出队列，有任务退回时重新入队
    fn register(self: &Arc<Self>, job: &Arc<ServerJob>) {
        let queue = Arc::downgrade(self);
        let weak = Arc::downgrade(job);
        job.add_on_done(move || {
            if let (Some(queue), Some(job)) = (queue.upgrade(), weak.upgrade()) {
                queue.remove(&job);
            }
        });
        let queue = Arc::downgrade(self);
        let weak = Arc::downgrade(job);
        job.set_on_requeue(Arc::new(move || {
            if let (Some(queue), Some(job)) = (queue.upgrade(), weak.upgrade()) {
                queue.requeue(&job);
            }
        }));
    }

    fn enqueue(&self, job: &Arc<ServerJob>) {
        {
            let mut state = sync::lock(&self.state);
            if !state.is_queued(job) {
                state.push(Arc::clone(job));
            }
        }
        self.wakeup.notify_one();
    }

    /// 有任务退回或新任务可分发时回到队列
    pub fn requeue(&self, job: &Arc<ServerJob>) {
        if job.is_ended() || job.is_cancelled() {
            return;
        }
        self.enqueue(job);
    }

    fn retire(&self, job: &Arc<ServerJob>) {
        let mut state = sync::lock(&self.state);
        if state
            .jobs
            .get(&job.uuid())
            .is_some_and(|current| Arc::ptr_eq(current, job))
        {
            state.jobs.remove(&job.uuid());
        }
        state.unqueue(job, job.priority());
        metrics::job_count(state.jobs.len());
    }

    /// 作业结束后移除；映射中已是同 uuid 的新作业时保留新作业
    pub fn remove(&self, job: &Arc<ServerJob>) {
        self.retire(job);
        debug!("驱动端作业 {} 移出队列", job.name());
    }

    /// 从作业切出一次节点分发；没有可分发任务的作业离开队列，
    /// 有任务退回时经重新入队回调回到队列
    pub fn next_dispatch(
        &self,
        job: &Arc<ServerJob>,
        max_tasks: usize,
        node_uuid: &str,
    ) -> Option<Arc<ServerTaskBundleNode>> {
        let mut state = sync::lock(&self.state);
        let dispatch = job.create_node_dispatch(max_tasks, node_uuid);
        if job.pending_task_count() == 0 {
            state.unqueue(job, job.priority());
        } else if dispatch.is_some() && state.unqueue(job, job.priority()) {
            state.push(Arc::clone(job));
        }
        dispatch
    }

    pub fn jobs_in_order(&self) -> Vec<Arc<ServerJob>> {
        sync::lock(&self.state)
            .priority_map
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    /// 为待展开的广播作业创建按节点绑定的子作业
    pub fn expand_broadcasts(self: &Arc<Self>, nodes: &[BroadcastTarget]) {
        if nodes.is_empty() {
            return;
        }
        let parents: Vec<Arc<ServerJob>> = sync::lock(&self.state)
            .jobs
            .values()
            .filter(|job| job.is_broadcast_parent() && !job.is_expanded())
            .cloned()
            .collect();
        for parent in parents {
            let children = parent.expand_broadcast(nodes);
            if children.is_empty() {
                continue;
            }
            for child in &children {
                self.register(child);
            }
            let mut state = sync::lock(&self.state);
            state.unqueue(&parent, parent.priority());
            for child in children {
                state.jobs.insert(child.uuid(), Arc::clone(&child));
                state.push(child);
            }
            drop(state);
            self.wakeup.notify_one();
        }
    }

    pub fn job(&self, uuid: Uuid) -> Option<Arc<ServerJob>> {
        sync::lock(&self.state).jobs.get(&uuid).cloned()
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
            let Some(job) = state.jobs.get(&uuid).cloned() else {
                return false;
            };
            let old = job.priority();
            let was_queued = state.unqueue(&job, old);
            job.set_priority(priority);
            if was_queued {
                state.push(job);
            }
        }
        self.wakeup.notify_one();
        true
    }

    /// 节点移除：绑定该节点的广播子作业以剩余任务失败的方式强制完成
    pub fn cancel_broadcast_jobs(&self, node_uuid: &str) {
        let bound: Vec<Arc<ServerJob>> = sync::lock(&self.state)
            .jobs
            .values()
            .filter(|job| job.broadcast_node() == Some(node_uuid))
            .cloned()
            .collect();
        for job in bound {
            job.force_complete(TaskError::channel_failure(format!(
                "广播目标节点 {} 已断开",
                node_uuid
            )));
        }
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.state).queued_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn job_count(&self) -> usize {
        sync::lock(&self.state).jobs.len()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let jobs: Vec<Arc<ServerJob>> = sync::lock(&self.state).jobs.values().cloned().collect();
        info!("关闭驱动端队列，取消 {} 个作业", jobs.len());
        for job in jobs {
            if job.parent().is_none() {
                job.cancel(true);
            }
        }
    }
}
