use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use grid_core::errors::GridError;
use grid_core::models::{
    AtomicStatus, Job, JobMetadata, JobResults, JobSla, JobStatus, SubmissionStatus,
    SystemInformation, Task, TaskError, TaskGraph, TaskState,
};
use grid_core::sync;
use grid_core::traits::{JobEvent, JobNotifier};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bundle::ClientTaskBundle;

type DoneCallback = Box<dyn FnOnce() + Send>;
type RequeueCallback = Arc<dyn Fn() + Send + Sync>;

/// 已切出但尚未完成的一次分发
struct DispatchRecord {
    channel_uuid: String,
    positions: Vec<usize>,
    /// 尚未返回的任务副本
    outstanding: BTreeMap<usize, Task>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ClientJobState {
    pending: VecDeque<Task>,
    dispatches: HashMap<u64, DispatchRecord>,
    results: BTreeMap<usize, Task>,
    channel_counts: HashMap<String, usize>,
    dispatch_count: usize,
    /// 广播子作业，完成后移除
    children: HashMap<Uuid, Arc<ClientJob>>,
    broadcast_results: BTreeMap<String, Vec<Task>>,
    expanded: bool,
    started: bool,
    ended: bool,
}

/// 提交端的作业包装。
///
/// 每个任务位置在任意时刻只处于待分发队列、某个分发记录或结果集之一，
/// 三者之间的移动都在同一把作业锁内完成。
pub struct ClientJob {
    uuid: Uuid,
    name: String,
    sla: JobSla,
    metadata: JobMetadata,
    task_graph: Option<TaskGraph>,
    task_count: usize,
    priority: AtomicI32,
    broadcast_channel: Option<String>,
    parent: Option<Weak<ClientJob>>,
    status: AtomicStatus<JobStatus>,
    submission: AtomicStatus<SubmissionStatus>,
    cancelling: AtomicBool,
    expired: AtomicBool,
    pending: AtomicBool,
    state: Mutex<ClientJobState>,
    notifier: Arc<JobNotifier>,
    results_tx: watch::Sender<Option<Arc<JobResults>>>,
    on_done: Mutex<Vec<DoneCallback>>,
    on_requeue: Mutex<Option<RequeueCallback>>,
    queue_entry_time: Mutex<Option<DateTime<Utc>>>,
}

enum Completion {
    NotYet,
    Ended(Arc<JobResults>),
}

impl ClientJob {
    pub fn new(job: Job, notifier: Arc<JobNotifier>) -> Arc<Self> {
        let Job {
            uuid,
            name,
            tasks,
            sla,
            metadata,
            task_graph,
        } = job;
        Arc::new(Self::build(
            uuid, name, tasks, sla, metadata, task_graph, None, None, notifier,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        uuid: Uuid,
        name: String,
        tasks: Vec<Task>,
        sla: JobSla,
        metadata: JobMetadata,
        task_graph: Option<TaskGraph>,
        broadcast_channel: Option<String>,
        parent: Option<Weak<ClientJob>>,
        notifier: Arc<JobNotifier>,
    ) -> Self {
        let (results_tx, _) = watch::channel(None);
        let task_count = tasks.len();
        let priority = AtomicI32::new(sla.priority);
        let state = ClientJobState {
            pending: tasks.into_iter().collect(),
            ..ClientJobState::default()
        };
        Self {
            uuid,
            name,
            sla,
            metadata,
            task_graph,
            task_count,
            priority,
            broadcast_channel,
            parent,
            status: AtomicStatus::new(JobStatus::New),
            submission: AtomicStatus::new(SubmissionStatus::Submitted),
            cancelling: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            state: Mutex::new(state),
            notifier,
            results_tx,
            on_done: Mutex::new(Vec::new()),
            on_requeue: Mutex::new(None),
            queue_entry_time: Mutex::new(None),
        }
    }

    /// 为每个目标通道创建一个完整复制任务集的子作业，父作业持有子作业
    pub fn create_broadcast_children(
        self: &Arc<Self>,
        channels: &[(String, String)],
    ) -> Vec<Arc<ClientJob>> {
        let template: Vec<Task> = {
            let state = sync::lock(&self.state);
            state.pending.iter().cloned().collect()
        };
        let children: Vec<Arc<ClientJob>> = channels
            .iter()
            .map(|(channel_uuid, host)| {
                Arc::new(Self::build(
                    Uuid::new_v4(),
                    format!("{} [channel: {}]", self.name, host),
                    template.clone(),
                    self.sla.clone(),
                    self.metadata.clone(),
                    self.task_graph.clone(),
                    Some(channel_uuid.clone()),
                    Some(Arc::downgrade(self)),
                    Arc::clone(&self.notifier),
                ))
            })
            .collect();

        let mut state = sync::lock(&self.state);
        state.expanded = true;
        for child in &children {
            state.children.insert(child.uuid, Arc::clone(child));
        }
        debug!("广播作业 {} 展开为 {} 个子作业", self.name, children.len());
        children
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sla(&self) -> &JobSla {
        &self.sla
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    pub fn task_graph(&self) -> Option<&TaskGraph> {
        self.task_graph.as_ref()
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub fn status(&self) -> JobStatus {
        self.status.get()
    }

    pub fn submission_status(&self) -> SubmissionStatus {
        self.submission.get()
    }

    pub fn is_broadcast_parent(&self) -> bool {
        self.sla.broadcast && self.broadcast_channel.is_none()
    }

    /// 广播子作业绑定的通道
    pub fn broadcast_channel(&self) -> Option<&str> {
        self.broadcast_channel.as_deref()
    }

    pub fn parent(&self) -> Option<Arc<ClientJob>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelling.load(Ordering::Acquire) || self.status.get() == JobStatus::Cancelled
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// 等待启动时间的作业不接受任何通道
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::Release);
    }

    pub fn is_ended(&self) -> bool {
        sync::lock(&self.state).ended
    }

    pub fn pending_task_count(&self) -> usize {
        sync::lock(&self.state).pending.len()
    }

    pub fn dispatch_count(&self) -> usize {
        sync::lock(&self.state).dispatch_count
    }

    /// 当前服务该作业的不同通道数
    pub fn channel_count(&self) -> usize {
        sync::lock(&self.state).channel_counts.len()
    }

    pub fn channel_dispatch_count(&self, channel_uuid: &str) -> usize {
        sync::lock(&self.state)
            .channel_counts
            .get(channel_uuid)
            .copied()
            .unwrap_or(0)
    }

    pub fn queue_entry_time(&self) -> Option<DateTime<Utc>> {
        *sync::lock(&self.queue_entry_time)
    }

    pub(crate) fn mark_queued(&self) {
        self.submission.advance(SubmissionStatus::Pending);
        *sync::lock(&self.queue_entry_time) = Some(Utc::now());
    }

    /// 先做结构性检查，最后才对执行策略求值
    pub fn accepts_channel(&self, channel_uuid: &str, info: &SystemInformation) -> bool {
        if self.is_cancelled() || self.is_pending() || self.is_expired() {
            return false;
        }
        {
            let state = sync::lock(&self.state);
            let channel_dispatches = state.channel_counts.get(channel_uuid).copied().unwrap_or(0);
            if channel_dispatches == 0 && state.channel_counts.len() >= self.sla.max_channels {
                return false;
            }
            if !self.sla.allow_multiple_dispatches_to_same_channel && channel_dispatches > 0 {
                return false;
            }
        }
        match &self.sla.execution_policy {
            Some(policy) => policy.accepts(info),
            None => true,
        }
    }

    pub fn add_channel(&self, channel_uuid: &str) {
        let mut state = sync::lock(&self.state);
        state.dispatch_count += 1;
        *state
            .channel_counts
            .entry(channel_uuid.to_string())
            .or_insert(0) += 1;
    }

    pub fn remove_channel(&self, channel_uuid: &str) {
        let mut state = sync::lock(&self.state);
        state.dispatch_count = state.dispatch_count.saturating_sub(1);
        let remaining = match state.channel_counts.get_mut(channel_uuid) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.channel_counts.remove(channel_uuid);
        }
    }

    /// 从待分发队列头部切出最多 `max_tasks` 个任务
    pub fn next_bundle(
        self: &Arc<Self>,
        max_tasks: usize,
        channel_uuid: &str,
    ) -> Option<Arc<ClientTaskBundle>> {
        let mut state = sync::lock(&self.state);
        if state.pending.is_empty() || max_tasks == 0 {
            return None;
        }
        let count = max_tasks.min(state.pending.len());
        let tasks: Vec<Task> = state.pending.drain(..count).collect();
        let bundle = Arc::new(ClientTaskBundle::new(self, channel_uuid, tasks));
        state.dispatches.insert(
            bundle.id(),
            DispatchRecord {
                channel_uuid: channel_uuid.to_string(),
                positions: bundle.positions(),
                outstanding: bundle.tasks_snapshot().into_iter().map(|t| (t.position(), t)).collect(),
                cancel: bundle.cancel_token(),
            },
        );
        debug!(
            "作业 {} 切出任务束 {}，共 {} 个任务，剩余 {} 个",
            self.name,
            bundle.id(),
            count,
            state.pending.len()
        );
        Some(bundle)
    }

    /// 任务束已交给通道发送
    pub fn job_dispatched(&self, bundle_id: u64, channel_uuid: &str) {
        let (first, positions) = {
            let mut state = sync::lock(&self.state);
            let Some(record) = state.dispatches.get(&bundle_id) else {
                debug!("作业 {} 的任务束 {} 已不在分发记录中", self.name, bundle_id);
                return;
            };
            let positions = record.positions.clone();
            let first = !state.started;
            state.started = true;
            (first, positions)
        };
        if first {
            self.status.compare_and_set(JobStatus::New, JobStatus::Executing);
            self.submission.advance(SubmissionStatus::Executing);
            match self.parent() {
                Some(parent) => parent.broadcast_dispatched(),
                None => self
                    .notifier
                    .fire(JobEvent::started(self.uuid, &self.name)),
            }
        }
        self.notifier.fire(JobEvent::dispatched(
            self.uuid,
            &self.name,
            positions,
            channel_uuid,
        ));
    }

    /// 合并一批返回的任务；返回被接受的数量
    pub fn results_received(&self, bundle_id: u64, tasks: Vec<Task>) -> usize {
        let (accepted, requeue, completion) = {
            let mut state = sync::lock(&self.state);
            let was_empty = state.pending.is_empty();
            let mut accepted = 0;
            for mut task in tasks {
                let position = task.position();
                let known = state
                    .dispatches
                    .get(&bundle_id)
                    .is_some_and(|record| record.outstanding.contains_key(&position));
                if !known {
                    debug!("忽略作业 {} 的过期结果，位置 {}", self.name, position);
                    continue;
                }
                match task.state() {
                    TaskState::Pending => continue,
                    TaskState::Resubmit => {
                        if task.resubmit(self.sla.max_task_resubmits, self.sla.resubmit_exhausted) {
                            if let Some(record) = state.dispatches.get_mut(&bundle_id) {
                                record.outstanding.remove(&position);
                            }
                            state.pending.push_back(task);
                            accepted += 1;
                            continue;
                        }
                    }
                    _ => {}
                }
                if let Some(record) = state.dispatches.get_mut(&bundle_id) {
                    record.outstanding.remove(&position);
                }
                Self::store_result(&self.name, &mut state, task);
                accepted += 1;
            }
            let requeue = was_empty && !state.pending.is_empty() && !self.is_cancelled();
            (accepted, requeue, self.check_completion(&mut state))
        };
        if requeue {
            self.fire_requeue();
        }
        self.finish(completion);
        accepted
    }

    /// 任务束结束：剩余未返回的任务回到待分发队列
    pub fn task_completed(&self, bundle_id: u64, unreturned: Vec<Task>, error: Option<&GridError>) {
        let (record, requeue, completion) = {
            let mut state = sync::lock(&self.state);
            let Some(mut record) = state.dispatches.remove(&bundle_id) else {
                if !self.is_cancelled() {
                    debug!("作业 {} 的任务束 {} 已结束", self.name, bundle_id);
                }
                return;
            };
            let was_empty = state.pending.is_empty();
            let mut latest: HashMap<usize, Task> =
                unreturned.into_iter().map(|t| (t.position(), t)).collect();
            let outstanding = std::mem::take(&mut record.outstanding);
            for (position, snapshot) in outstanding {
                let mut task = latest.remove(&position).unwrap_or(snapshot);
                if task.is_done() {
                    Self::store_result(&self.name, &mut state, task);
                    continue;
                }
                task.restore_pending();
                state.pending.push_back(task);
            }
            if !was_empty || !state.pending.is_empty() {
                state.pending.make_contiguous().sort_by_key(Task::position);
            }
            let requeue = was_empty && !state.pending.is_empty() && !self.is_cancelled();
            (record, requeue, self.check_completion(&mut state))
        };
        if let Some(e) = error {
            warn!("作业 {} 的任务束 {} 异常结束: {}", self.name, bundle_id, e);
        }
        self.notifier.fire(JobEvent::returned(
            self.uuid,
            &self.name,
            record.positions,
            &record.channel_uuid,
        ));
        if requeue {
            self.fire_requeue();
        }
        self.finish(completion);
    }

    /// CAS 切换到 CANCELLED，仅当前状态不晚于 EXECUTING 时成功
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if !self
            .status
            .transition_if_at_most(JobStatus::Executing, JobStatus::Cancelled)
        {
            debug!("作业 {} 已不可取消: {:?}", self.name, self.status.get());
            return false;
        }
        self.cancelling.store(true, Ordering::Release);
        info!("取消作业 {} ({})", self.name, self.uuid);

        let children: Vec<Arc<ClientJob>> =
            sync::lock(&self.state).children.values().cloned().collect();
        for child in children {
            child.cancel(may_interrupt);
        }

        let completion = {
            let mut state = sync::lock(&self.state);
            let records: Vec<DispatchRecord> = state.dispatches.drain().map(|(_, r)| r).collect();
            for record in records {
                if may_interrupt {
                    record.cancel.cancel();
                }
                for (_, mut task) in record.outstanding {
                    task.cancel();
                    Self::store_result(&self.name, &mut state, task);
                }
            }
            let pending: Vec<Task> = state.pending.drain(..).collect();
            for mut task in pending {
                task.cancel();
                Self::store_result(&self.name, &mut state, task);
            }
            self.submission.advance(SubmissionStatus::Complete);
            self.check_completion(&mut state)
        };
        self.finish(completion);
        true
    }

    /// 作业过期：标记后取消，子作业一并取消
    pub fn job_expired(&self) {
        info!("作业 {} 已过期", self.name);
        self.expired.store(true, Ordering::Release);
        self.cancel(true);
    }

    /// 强制完成：所有未完成任务以 `error` 失败
    pub fn force_complete(&self, error: TaskError) {
        let completion = {
            let mut state = sync::lock(&self.state);
            if state.ended {
                return;
            }
            info!("强制完成作业 {}: {}", self.name, error);
            let records: Vec<DispatchRecord> = state.dispatches.drain().map(|(_, r)| r).collect();
            for record in records {
                record.cancel.cancel();
                for (_, mut task) in record.outstanding {
                    task.exception_received(error.clone());
                    Self::store_result(&self.name, &mut state, task);
                }
            }
            let pending: Vec<Task> = state.pending.drain(..).collect();
            for mut task in pending {
                task.exception_received(error.clone());
                Self::store_result(&self.name, &mut state, task);
            }
            self.check_completion(&mut state)
        };
        self.finish(completion);
    }

    /// 零任务作业立即完成
    pub fn complete_if_empty(&self) {
        let completion = {
            let mut state = sync::lock(&self.state);
            self.check_completion(&mut state)
        };
        self.finish(completion);
    }

    /// 广播作业没有任何目标通道时以空结果结束
    pub fn complete_without_targets(&self) {
        let completion = {
            let mut state = sync::lock(&self.state);
            state.expanded = true;
            self.check_completion(&mut state)
        };
        self.finish(completion);
    }

    fn broadcast_dispatched(&self) {
        let first = {
            let mut state = sync::lock(&self.state);
            let first = !state.started;
            state.started = true;
            first
        };
        if first {
            self.status.compare_and_set(JobStatus::New, JobStatus::Executing);
            self.submission.advance(SubmissionStatus::Executing);
            self.notifier.fire(JobEvent::started(self.uuid, &self.name));
        }
    }

    fn broadcast_completed(&self, child: &ClientJob, results: &JobResults) {
        let completion = {
            let mut state = sync::lock(&self.state);
            if state.children.remove(&child.uuid).is_none() {
                return;
            }
            if let Some(channel) = child.broadcast_channel() {
                state
                    .broadcast_results
                    .insert(channel.to_string(), results.tasks.clone());
            }
            debug!(
                "广播子作业 {} 完成，剩余 {} 个",
                child.name,
                state.children.len()
            );
            self.check_completion(&mut state)
        };
        self.finish(completion);
    }

    pub fn add_on_done(&self, callback: impl FnOnce() + Send + 'static) {
        sync::lock(&self.on_done).push(Box::new(callback));
    }

    pub(crate) fn set_on_requeue(&self, callback: RequeueCallback) {
        *sync::lock(&self.on_requeue) = Some(callback);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<JobResults>>> {
        self.results_tx.subscribe()
    }

    pub fn results(&self) -> Option<Arc<JobResults>> {
        self.results_tx.borrow().clone()
    }

    fn store_result(job_name: &str, state: &mut ClientJobState, task: Task) {
        let position = task.position();
        if state.results.contains_key(&position) {
            warn!("作业 {} 的位置 {} 已有结果，忽略重复结果", job_name, position);
            return;
        }
        state.results.insert(position, task);
    }

    fn check_completion(&self, state: &mut ClientJobState) -> Completion {
        if state.ended {
            return Completion::NotYet;
        }
        let complete = if self.is_broadcast_parent() {
            state.children.is_empty()
                && (state.expanded || self.status.get() == JobStatus::Cancelled)
        } else {
            state.results.len() >= self.task_count && state.dispatches.is_empty()
        };
        if !complete {
            return Completion::NotYet;
        }
        state.ended = true;
        self.status
            .transition_if_at_most(JobStatus::Executing, JobStatus::Done);
        self.submission.advance(SubmissionStatus::Complete);
        self.submission.advance(SubmissionStatus::Ended);
        let results = JobResults {
            job_uuid: self.uuid,
            job_name: self.name.clone(),
            cancelled: self.status.get() == JobStatus::Cancelled,
            expired: self.is_expired(),
            tasks: state.results.values().cloned().collect(),
            broadcast: std::mem::take(&mut state.broadcast_results),
        };
        Completion::Ended(Arc::new(results))
    }

    /// done(): 发布结果、通知监听器并执行完成回调的快照
    fn finish(&self, completion: Completion) {
        let Completion::Ended(results) = completion else {
            return;
        };
        info!(
            "作业 {} 已结束，共 {} 个任务结果",
            self.name,
            results.tasks.len()
        );
        self.results_tx.send_replace(Some(Arc::clone(&results)));
        self.notifier.fire(JobEvent::ended(self.uuid, &self.name));
        let callbacks: Vec<DoneCallback> = std::mem::take(&mut *sync::lock(&self.on_done));
        for callback in callbacks {
            callback();
        }
        sync::lock(&self.on_requeue).take();
        if let Some(parent) = self.parent() {
            parent.broadcast_completed(self, &results);
        }
    }

    fn fire_requeue(&self) {
        let callback = sync::lock(&self.on_requeue).clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for ClientJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientJob")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("submission", &self.submission)
            .finish()
    }
}
