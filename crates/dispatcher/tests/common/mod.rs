//! 集成测试共用的假实现：脚本化传输、记录事件的监听器与任务执行器

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use grid_core::config::RemoteConfig;
use grid_core::errors::{GridError, GridResult};
use grid_core::load_balancer::{client_default_info, LoadBalancerFactory};
use grid_core::models::{
    BundleMessage, Payload, RejectedTask, ResultMessage, SendAck, Task, TaskErrorKind,
};
use grid_core::traits::{
    FnRunner, JobEvent, JobEventKind, JobListener, TaskOutcome, TaskRunner, Transport,
};
use grid_dispatcher::JobManager;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

pub fn manager() -> JobManager {
    let factory = Arc::new(LoadBalancerFactory::new(client_default_info()).unwrap());
    JobManager::with_factory(factory, Duration::from_millis(20))
}

/// 重连快速且没有抖动
pub fn remote_config() -> RemoteConfig {
    RemoteConfig {
        reconnect_initial_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        reconnect_max_attempts: 3,
        reconnect_jitter: 0.0,
        ..RemoteConfig::default()
    }
}

pub fn upper(text: &str) -> Payload {
    Payload::from(text.to_uppercase().as_str())
}

pub fn upper_runner() -> Arc<dyn TaskRunner> {
    Arc::new(FnRunner::new("upper", |task: &Task| {
        let text = String::from_utf8_lossy(task.payload().as_bytes()).to_string();
        TaskOutcome::Completed(upper(&text))
    }))
}

/// 每个任务先等待 `delay` 再返回大写负载
pub struct SleepRunner {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SleepRunner {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TaskRunner for SleepRunner {
    async fn run(&self, task: &Task) -> TaskOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let text = String::from_utf8_lossy(task.payload().as_bytes()).to_string();
        TaskOutcome::Completed(upper(&text))
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

/// 按顺序记录所有作业事件
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self, job: Uuid, kind: JobEventKind) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job_uuid == job && e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn all(&self, kind: JobEventKind) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    fn record(&self, event: &JobEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl JobListener for RecordingListener {
    fn job_started(&self, event: &JobEvent) {
        self.record(event);
    }

    fn job_dispatched(&self, event: &JobEvent) {
        self.record(event);
    }

    fn job_returned(&self, event: &JobEvent) {
        self.record(event);
    }

    fn job_ended(&self, event: &JobEvent) {
        self.record(event);
    }
}

/// 跟踪每个通道上同一作业的在途分发数
#[derive(Default)]
pub struct ConcurrencyTracker {
    outstanding: Mutex<HashMap<String, usize>>,
    max_seen: AtomicUsize,
}

impl ConcurrencyTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

impl JobListener for ConcurrencyTracker {
    fn job_dispatched(&self, event: &JobEvent) {
        let Some(channel) = &event.channel_uuid else {
            return;
        };
        let mut outstanding = self.outstanding.lock().unwrap();
        let count = outstanding.entry(channel.clone()).or_insert(0);
        *count += 1;
        self.max_seen.fetch_max(*count, Ordering::SeqCst);
    }

    fn job_returned(&self, event: &JobEvent) {
        let Some(channel) = &event.channel_uuid else {
            return;
        };
        if let Some(count) = self.outstanding.lock().unwrap().get_mut(channel) {
            *count = count.saturating_sub(1);
        }
    }
}

/// 脚本化的远程传输：在发送时直接计算结果，可以注入发送失败、
/// 拒收与连接中断
pub struct ScriptedTransport {
    results_tx: mpsc::UnboundedSender<ResultMessage>,
    results_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ResultMessage>>,
    sent: Mutex<Vec<BundleMessage>>,
    failing_sends: AtomicUsize,
    rejected: Mutex<Vec<usize>>,
    respond: AtomicBool,
    refuse_reconnect: AtomicBool,
    broken: Notify,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            results_tx,
            results_rx: tokio::sync::Mutex::new(results_rx),
            sent: Mutex::new(Vec::new()),
            failing_sends: AtomicUsize::new(0),
            rejected: Mutex::new(Vec::new()),
            respond: AtomicBool::new(true),
            refuse_reconnect: AtomicBool::new(false),
            broken: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// 接下来的 `count` 次发送以传输错误失败
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn reject_positions(&self, positions: Vec<usize>) {
        *self.rejected.lock().unwrap() = positions;
    }

    /// 收下任务束但不返回结果
    pub fn hold_results(&self) {
        self.respond.store(false, Ordering::SeqCst);
    }

    pub fn refuse_reconnect(&self) {
        self.refuse_reconnect.store(true, Ordering::SeqCst);
    }

    /// 让等待中的接收以断开错误返回
    pub fn break_connection(&self) {
        self.broken.notify_one();
    }

    pub fn sent(&self) -> Vec<BundleMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, bundle: BundleMessage) -> GridResult<SendAck> {
        self.sent.lock().unwrap().push(bundle.clone());
        let failing = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(GridError::Transport("连接被重置".to_string()));
        }

        let rejected = self.rejected.lock().unwrap().clone();
        let ack = SendAck {
            rejected: rejected
                .iter()
                .filter(|p| bundle.tasks.iter().any(|t| t.position() == **p))
                .map(|p| RejectedTask::new(*p, TaskErrorKind::Rejected, "对端拒收"))
                .collect(),
        };
        if self.respond.load(Ordering::SeqCst) {
            let tasks: Vec<Task> = bundle
                .tasks
                .into_iter()
                .filter(|t| !rejected.contains(&t.position()))
                .map(|mut task| {
                    let text = String::from_utf8_lossy(task.payload().as_bytes()).to_string();
                    task.result_received(upper(&text));
                    task
                })
                .collect();
            if !tasks.is_empty() {
                let _ = self.results_tx.send(ResultMessage {
                    bundle_id: bundle.header.bundle_id,
                    tasks,
                });
            }
        }
        Ok(ack)
    }

    async fn receive(&self) -> GridResult<ResultMessage> {
        let mut results = self.results_rx.lock().await;
        tokio::select! {
            _ = self.broken.notified() => Err(GridError::Disconnected("连接中断".to_string())),
            message = results.recv() => {
                message.ok_or_else(|| GridError::Disconnected("结果队列已关闭".to_string()))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn reconnect(&self) -> GridResult<()> {
        if self.refuse_reconnect.load(Ordering::SeqCst) {
            return Err(GridError::Transport("拒绝连接".to_string()));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// 轮询直到条件成立或超时
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
