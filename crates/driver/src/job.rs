use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use grid_core::errors::{GridError, GridResult};
use grid_core::models::{
    AtomicStatus, BundleHeader, JobSla, JobStatus, SubmissionStatus, SystemInformation, Task,
    TaskError, TaskErrorKind, TaskState,
};
use grid_core::sync;
use grid_core::traits::{JobEvent, JobNotifier};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bundle_client::ServerTaskBundleClient;
use crate::bundle_node::ServerTaskBundleNode;

type DoneCallback = Box<dyn FnOnce() + Send>;
type RequeueCallback = Arc<dyn Fn() + Send + Sync>;
type DeliveryMap = HashMap<u64, (Arc<ServerTaskBundleClient>, Vec<Task>)>;

/// 广播目标节点
#[derive(Debug, Clone)]
pub struct BroadcastTarget {
    pub node_uuid: String,
    pub host: String,
    pub info: SystemInformation,
}

struct NodeDispatch {
    node_uuid: String,
    positions: Vec<usize>,
    outstanding: BTreeMap<usize, Task>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ServerJobState {
    pending: BTreeMap<usize, Task>,
    /// 位置 → 所属客户端任务束
    owners: HashMap<usize, Arc<ServerTaskBundleClient>>,
    client_bundles: Vec<Arc<ServerTaskBundleClient>>,
    dispatches: HashMap<u64, NodeDispatch>,
    /// 已到达终态的位置，依赖图据此放行任务
    terminal: BTreeSet<usize>,
    /// 需要到达终态的位置总数
    expected: usize,
    /// 未绑定客户端任务束的结果：广播子作业的结果或广播父作业的合并结果
    results: BTreeMap<usize, Task>,
    node_counts: HashMap<String, usize>,
    children: HashMap<Uuid, Arc<ServerJob>>,
    expanded: bool,
    started: bool,
    ended: bool,
}

impl ServerJobState {
    /// 终态任务交给所属客户端任务束；没有所属任务束时留在结果集中
    fn task_terminated(&mut self, task: Task, delivery: &mut DeliveryMap) {
        let position = task.position();
        if !self.terminal.insert(position) {
            warn!("位置 {} 已到达终态，忽略重复结果", position);
            return;
        }
        match self.owners.get(&position) {
            Some(owner) => delivery
                .entry(owner.bundle_id())
                .or_insert_with(|| (Arc::clone(owner), Vec::new()))
                .1
                .push(task),
            None => {
                self.results.insert(position, task);
            }
        }
    }

    fn release_node(&mut self, node_uuid: &str) {
        let remaining = match self.node_counts.get_mut(node_uuid) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            self.node_counts.remove(node_uuid);
        }
    }
}

enum Completion {
    NotYet,
    Ended(Vec<Task>),
}

/// 驱动端的作业：合并同一作业的多个客户端任务束，切分后分发给节点。
///
/// 任务在待分发集合、节点分发记录与终态集合之间的移动都在作业锁内完成；
/// 结果转发、监听器与回调都在锁外执行。
pub struct ServerJob {
    uuid: Uuid,
    name: String,
    header: BundleHeader,
    priority: AtomicI32,
    broadcast_node: Option<String>,
    parent: Option<Weak<ServerJob>>,
    status: AtomicStatus<JobStatus>,
    submission: AtomicStatus<SubmissionStatus>,
    cancelling: AtomicBool,
    state: Mutex<ServerJobState>,
    notifier: Arc<JobNotifier>,
    on_done: Mutex<Vec<DoneCallback>>,
    on_requeue: Mutex<Option<RequeueCallback>>,
}

impl ServerJob {
    pub fn new(header: BundleHeader, notifier: Arc<JobNotifier>) -> Arc<Self> {
        Arc::new(Self::build(
            header.job_uuid,
            header.job_name.clone(),
            header,
            None,
            None,
            ServerJobState::default(),
            notifier,
        ))
    }

    fn build(
        uuid: Uuid,
        name: String,
        header: BundleHeader,
        broadcast_node: Option<String>,
        parent: Option<Weak<ServerJob>>,
        state: ServerJobState,
        notifier: Arc<JobNotifier>,
    ) -> Self {
        Self {
            uuid,
            name,
            priority: AtomicI32::new(header.sla.priority),
            header,
            broadcast_node,
            parent,
            status: AtomicStatus::new(JobStatus::New),
            submission: AtomicStatus::new(SubmissionStatus::Submitted),
            cancelling: AtomicBool::new(false),
            state: Mutex::new(state),
            notifier,
            on_done: Mutex::new(Vec::new()),
            on_requeue: Mutex::new(None),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &BundleHeader {
        &self.header
    }

    pub fn sla(&self) -> &JobSla {
        &self.header.sla
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
        self.header.sla.broadcast && self.broadcast_node.is_none()
    }

    pub fn broadcast_node(&self) -> Option<&str> {
        self.broadcast_node.as_deref()
    }

    pub fn parent(&self) -> Option<Arc<ServerJob>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelling.load(Ordering::Acquire) || self.status.get() == JobStatus::Cancelled
    }

    pub fn is_ended(&self) -> bool {
        sync::lock(&self.state).ended
    }

    pub fn pending_task_count(&self) -> usize {
        sync::lock(&self.state).pending.len()
    }

    pub fn dispatch_count(&self) -> usize {
        sync::lock(&self.state).dispatches.len()
    }

    pub fn node_count(&self) -> usize {
        sync::lock(&self.state).node_counts.len()
    }

    pub fn node_dispatch_count(&self, node_uuid: &str) -> usize {
        sync::lock(&self.state)
            .node_counts
            .get(node_uuid)
            .copied()
            .unwrap_or(0)
    }

    pub fn client_bundle_count(&self) -> usize {
        sync::lock(&self.state).client_bundles.len()
    }

    /// 已收到的不同任务位置数
    pub fn received_task_count(&self) -> usize {
        sync::lock(&self.state).owners.len()
    }

    /// 合并一个客户端任务束。
    ///
    /// 作业已完成时返回 [`GridError::JobAlreadyEnded`]；任何位置已存在时返回
    /// [`GridError::DuplicateTaskPosition`]，此时作业不做任何修改。
    /// 返回 true 表示作业此前没有待分发任务。
    pub fn add_bundle(&self, bundle: Arc<ServerTaskBundleClient>) -> GridResult<bool> {
        if self.submission.get().is_finished() {
            return Err(GridError::JobAlreadyEnded { uuid: self.uuid });
        }
        let mut state = sync::lock(&self.state);
        if state.ended || self.submission.get().is_finished() {
            return Err(GridError::JobAlreadyEnded { uuid: self.uuid });
        }
        if let Some(&position) = bundle.positions().iter().find(|p| state.owners.contains_key(p)) {
            error!(
                "作业 {} 收到重复的任务位置 {} (客户端任务束 {})",
                self.name,
                position,
                bundle.bundle_id()
            );
            return Err(GridError::DuplicateTaskPosition {
                job: self.uuid,
                position,
            });
        }
        let was_empty = state.pending.is_empty();
        for task in bundle.take_tasks() {
            let position = task.position();
            state.owners.insert(position, Arc::clone(&bundle));
            state.pending.insert(position, task);
        }
        state.expected = state.owners.len();
        state.client_bundles.push(Arc::clone(&bundle));
        self.submission.advance(SubmissionStatus::Pending);
        debug!(
            "作业 {} 合并客户端任务束 {}，共 {} 个任务，待分发 {} 个",
            self.name,
            bundle.bundle_id(),
            bundle.task_count(),
            state.pending.len()
        );
        Ok(was_empty)
    }

    /// 有可以立即分发的任务；带依赖图时只计算依赖均已到达终态的任务
    pub fn has_ready_tasks(&self) -> bool {
        let state = sync::lock(&self.state);
        match &self.header.task_graph {
            Some(graph) => state
                .pending
                .keys()
                .any(|&p| graph.is_ready(p, |d| state.terminal.contains(&d))),
            None => !state.pending.is_empty(),
        }
    }

    /// 先做结构性检查，最后才对执行策略求值
    pub fn accepts_node(&self, node_uuid: &str, info: &SystemInformation) -> bool {
        if self.is_cancelled() || self.is_broadcast_parent() {
            return false;
        }
        if let Some(bound) = &self.broadcast_node {
            if bound != node_uuid {
                return false;
            }
        }
        {
            let state = sync::lock(&self.state);
            if state.ended {
                return false;
            }
            let node_dispatches = state.node_counts.get(node_uuid).copied().unwrap_or(0);
            if node_dispatches == 0 && state.node_counts.len() >= self.header.sla.max_channels {
                return false;
            }
            if !self.header.sla.allow_multiple_dispatches_to_same_channel && node_dispatches > 0 {
                return false;
            }
        }
        match &self.header.sla.execution_policy {
            Some(policy) => policy.accepts(info),
            None => true,
        }
    }

    /// 切出最多 `max_tasks` 个可分发任务交给 `node_uuid`
    pub fn create_node_dispatch(
        self: &Arc<Self>,
        max_tasks: usize,
        node_uuid: &str,
    ) -> Option<Arc<ServerTaskBundleNode>> {
        if max_tasks == 0 || self.is_cancelled() {
            return None;
        }
        let mut state = sync::lock(&self.state);
        if state.ended {
            return None;
        }
        let positions: Vec<usize> = match &self.header.task_graph {
            Some(graph) => state
                .pending
                .keys()
                .copied()
                .filter(|&p| graph.is_ready(p, |d| state.terminal.contains(&d)))
                .take(max_tasks)
                .collect(),
            None => state.pending.keys().copied().take(max_tasks).collect(),
        };
        if positions.is_empty() {
            return None;
        }
        let tasks: Vec<Task> = positions
            .iter()
            .filter_map(|p| state.pending.remove(p))
            .collect();
        let bundle = Arc::new(ServerTaskBundleNode::new(self, node_uuid, tasks));
        state.dispatches.insert(
            bundle.id(),
            NodeDispatch {
                node_uuid: node_uuid.to_string(),
                positions: positions.clone(),
                outstanding: bundle.tasks().iter().map(|t| (t.position(), t.clone())).collect(),
                cancel: bundle.cancel_token(),
            },
        );
        *state.node_counts.entry(node_uuid.to_string()).or_insert(0) += 1;
        debug!(
            "作业 {} 向节点 {} 分发 {} 个任务，剩余 {} 个",
            self.name,
            node_uuid,
            positions.len(),
            state.pending.len()
        );
        Some(bundle)
    }

    /// 节点分发已开始执行；第一次分发时作业进入 EXECUTING
    pub fn job_dispatched(&self, bundle: &ServerTaskBundleNode) {
        let first = {
            let mut state = sync::lock(&self.state);
            if !state.dispatches.contains_key(&bundle.id()) {
                return;
            }
            let first = !state.started;
            state.started = true;
            first
        };
        if first {
            self.status.compare_and_set(JobStatus::New, JobStatus::Executing);
            self.submission.advance(SubmissionStatus::Executing);
            match self.parent() {
                Some(parent) => parent.broadcast_dispatched(),
                None => self.notifier.fire(JobEvent::started(self.uuid, &self.name)),
            }
        }
        self.notifier.fire(JobEvent::dispatched(
            self.uuid,
            &self.name,
            bundle.positions(),
            bundle.node_uuid(),
        ));
    }

    /// 节点返回一次分发的任务。
    ///
    /// RESUBMIT 的任务消耗重提交预算后回到待分发集合；未执行的任务直接退回；
    /// 终态任务按所属客户端任务束分组转发。
    pub fn results_received(&self, dispatch_id: u64, tasks: Vec<Task>) {
        let mut returned: HashMap<usize, Task> = tasks.into_iter().map(|t| (t.position(), t)).collect();
        self.dispatch_returned(dispatch_id, None, |state, position, snapshot| {
            let mut task = returned.remove(&position).unwrap_or(snapshot);
            match task.state() {
                TaskState::Resubmit => {
                    if task.resubmit(
                        self.header.sla.max_task_resubmits,
                        self.header.sla.resubmit_exhausted,
                    ) {
                        state.pending.insert(position, task);
                        return None;
                    }
                    Some(task)
                }
                TaskState::Pending => {
                    state.pending.insert(position, task);
                    None
                }
                _ => Some(task),
            }
        });
    }

    /// 节点分发失败：全部任务退回待分发集合，不消耗重提交预算
    pub fn results_error(&self, dispatch_id: u64, error: &GridError) {
        self.dispatch_returned(dispatch_id, Some(error), |state, position, mut task| {
            task.restore_pending();
            state.pending.insert(position, task);
            None
        });
    }

    fn dispatch_returned<F>(&self, dispatch_id: u64, error: Option<&GridError>, mut settle: F)
    where
        F: FnMut(&mut ServerJobState, usize, Task) -> Option<Task>,
    {
        let mut delivery = DeliveryMap::new();
        let (record, requeue) = {
            let mut guard = sync::lock(&self.state);
            let state = &mut *guard;
            let Some(mut record) = state.dispatches.remove(&dispatch_id) else {
                debug!("作业 {} 的节点分发 {} 已结束", self.name, dispatch_id);
                return;
            };
            state.release_node(&record.node_uuid);
            let outstanding = std::mem::take(&mut record.outstanding);
            for (position, snapshot) in outstanding {
                if let Some(task) = settle(&mut *state, position, snapshot) {
                    state.task_terminated(task, &mut delivery);
                }
            }
            let requeue = !state.pending.is_empty() && !self.is_cancelled();
            (record, requeue)
        };
        if let Some(e) = error {
            warn!(
                "作业 {} 在节点 {} 上的分发 {} 失败: {}",
                self.name, record.node_uuid, dispatch_id, e
            );
        }
        Self::deliver(delivery);
        self.notifier.fire(JobEvent::returned(
            self.uuid,
            &self.name,
            record.positions,
            &record.node_uuid,
        ));
        if requeue {
            self.fire_requeue();
        }
        self.check_completion();
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
        info!("取消驱动端作业 {} ({})", self.name, self.uuid);

        let children: Vec<Arc<ServerJob>> =
            sync::lock(&self.state).children.values().cloned().collect();
        for child in children {
            child.cancel(may_interrupt);
        }

        self.terminate_all(
            |task| {
                task.cancel();
            },
            may_interrupt,
        );
        self.submission.advance(SubmissionStatus::Complete);
        self.check_completion();
        true
    }

    /// 所有未完成任务以 `error` 失败，用于绑定节点断开的广播子作业
    pub fn force_complete(&self, error: TaskError) {
        if self.is_ended() {
            return;
        }
        info!("强制完成驱动端作业 {}: {}", self.name, error);
        self.terminate_all(
            |task| {
                task.exception_received(error.clone());
            },
            true,
        );
        self.check_completion();
    }

    fn terminate_all(&self, mut apply: impl FnMut(&mut Task), interrupt: bool) {
        let mut delivery = DeliveryMap::new();
        {
            let mut state = sync::lock(&self.state);
            let records: Vec<NodeDispatch> = state.dispatches.drain().map(|(_, r)| r).collect();
            for mut record in records {
                if interrupt {
                    record.cancel.cancel();
                }
                state.release_node(&record.node_uuid);
                for (_, mut task) in std::mem::take(&mut record.outstanding) {
                    apply(&mut task);
                    state.task_terminated(task, &mut delivery);
                }
            }
            let pending: Vec<Task> = std::mem::take(&mut state.pending).into_values().collect();
            for mut task in pending {
                apply(&mut task);
                state.task_terminated(task, &mut delivery);
            }
        }
        Self::deliver(delivery);
    }

    /// 广播作业在所有位置到达后为每个满足执行策略的节点创建一个完整复制任务集的子作业。
    ///
    /// 没有节点满足执行策略时作业立即结束，所有任务以 `Rejected` 失败。
    pub fn expand_broadcast(self: &Arc<Self>, targets: &[BroadcastTarget]) -> Vec<Arc<ServerJob>> {
        if !self.is_broadcast_parent() || targets.is_empty() || self.is_cancelled() {
            return Vec::new();
        }
        let accepted: Vec<&BroadcastTarget> = targets
            .iter()
            .filter(|t| match &self.header.sla.execution_policy {
                Some(policy) => policy.accepts(&t.info),
                None => true,
            })
            .collect();
        let mut state = sync::lock(&self.state);
        if state.expanded || state.ended || state.owners.len() < self.header.job_task_count {
            return Vec::new();
        }
        state.expanded = true;
        if accepted.is_empty() {
            drop(state);
            info!("没有节点满足广播作业 {} 的执行策略", self.name);
            self.force_complete(TaskError::new(
                TaskErrorKind::Rejected,
                format!("没有节点满足广播作业 {} 的执行策略", self.name),
            ));
            return Vec::new();
        }
        let template: BTreeMap<usize, Task> = std::mem::take(&mut state.pending);
        let children: Vec<Arc<ServerJob>> = accepted
            .iter()
            .map(|target| {
                let child_state = ServerJobState {
                    pending: template.clone(),
                    expected: template.len(),
                    ..ServerJobState::default()
                };
                Arc::new(Self::build(
                    Uuid::new_v4(),
                    format!("{} [node: {}]", self.name, target.host),
                    self.header.clone(),
                    Some(target.node_uuid.clone()),
                    Some(Arc::downgrade(self)),
                    child_state,
                    Arc::clone(&self.notifier),
                ))
            })
            .collect();
        for child in &children {
            state.children.insert(child.uuid, Arc::clone(child));
        }
        info!("广播作业 {} 展开到 {} 个节点", self.name, children.len());
        children
    }

    pub fn is_expanded(&self) -> bool {
        sync::lock(&self.state).expanded
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

    /// 合并子作业结果：每个位置保留第一个 RESULT，没有时保留最后一个子作业的任务
    fn broadcast_completed(&self, child: &ServerJob, tasks: Vec<Task>) {
        let mut delivery = DeliveryMap::new();
        {
            let mut state = sync::lock(&self.state);
            if state.children.remove(&child.uuid).is_none() {
                return;
            }
            for task in tasks {
                let keep = state
                    .results
                    .get(&task.position())
                    .is_some_and(|existing| existing.state() == TaskState::Result);
                if !keep {
                    state.results.insert(task.position(), task);
                }
            }
            debug!(
                "广播子作业 {} 完成，剩余 {} 个",
                child.name,
                state.children.len()
            );
            if state.children.is_empty() {
                let merged: Vec<Task> = std::mem::take(&mut state.results).into_values().collect();
                for task in merged {
                    state.task_terminated(task, &mut delivery);
                }
            }
        }
        Self::deliver(delivery);
        self.check_completion();
    }

    pub fn add_on_done(&self, callback: impl FnOnce() + Send + 'static) {
        sync::lock(&self.on_done).push(Box::new(callback));
    }

    pub(crate) fn set_on_requeue(&self, callback: RequeueCallback) {
        *sync::lock(&self.on_requeue) = Some(callback);
    }

    /// 待分发与分发中的任务都已清空且所有位置到达终态时结束
    pub fn check_completion(&self) {
        let completion = {
            let mut state = sync::lock(&self.state);
            let complete = !state.ended
                && state.pending.is_empty()
                && state.dispatches.is_empty()
                && state.children.is_empty()
                && state.terminal.len() >= state.expected
                && (state.expected > 0 || self.is_cancelled());
            if complete {
                state.ended = true;
                self.status
                    .transition_if_at_most(JobStatus::Executing, JobStatus::Done);
                self.submission.advance(SubmissionStatus::Complete);
                self.submission.advance(SubmissionStatus::Ended);
                Completion::Ended(std::mem::take(&mut state.results).into_values().collect())
            } else {
                Completion::NotYet
            }
        };
        self.finish(completion);
    }

    fn finish(&self, completion: Completion) {
        let Completion::Ended(results) = completion else {
            return;
        };
        info!("驱动端作业 {} 已结束", self.name);
        self.notifier.fire(JobEvent::ended(self.uuid, &self.name));
        let callbacks: Vec<DoneCallback> = std::mem::take(&mut *sync::lock(&self.on_done));
        for callback in callbacks {
            callback();
        }
        sync::lock(&self.on_requeue).take();
        if let Some(parent) = self.parent() {
            parent.broadcast_completed(self, results);
        }
    }

    fn fire_requeue(&self) {
        let callback = sync::lock(&self.on_requeue).clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn deliver(delivery: DeliveryMap) {
        for (bundle, tasks) in delivery.into_values() {
            bundle.results_received(tasks);
        }
    }
}

impl std::fmt::Debug for ServerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerJob")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("submission", &self.submission)
            .finish()
    }
}
