use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use grid_core::config::RemoteConfig;
use grid_core::errors::{GridError, GridResult};
use grid_core::load_balancer::BundlerSlot;
use grid_core::models::{
    ConnectionStatus, ManagementInfo, ResultMessage, SystemInformation, TaskError, TaskErrorKind,
};
use grid_core::sync;
use grid_core::traits::Transport;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bundle_queue::BundleQueue;
use super::shared::ChannelCore;
use super::{ChannelContext, ExecutorChannel, StatusListener};
use crate::job::ClientTaskBundle;
use crate::metrics;

/// 重连退避策略：指数增长、封顶并叠加随机抖动
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            max_attempts: config.reconnect_max_attempts,
            jitter: config.reconnect_jitter.clamp(0.0, 1.0),
        }
    }

    /// 第 `attempt` 次重连前的等待时间，从 1 开始计数
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_delay)
    }
}

struct RemoteInner {
    core: ChannelCore,
    transport: Arc<dyn Transport>,
    host: String,
    queue: BundleQueue,
    /// 已发送、等待结果的任务束
    in_flight: Mutex<HashMap<u64, Arc<ClientTaskBundle>>>,
    /// 每次重连成功后递增，旧连接上的错误据此忽略
    generation: AtomicU64,
    reconnect: tokio::sync::Mutex<()>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
}

/// 经由 [`Transport`] 与远端驱动通信的通道。
///
/// 发送循环与接收循环是两个独立的 tokio 任务，结果按任务束 id 关联，
/// 不依赖返回顺序。
pub struct RemoteChannel {
    inner: Arc<RemoteInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        host: impl Into<String>,
        info: SystemInformation,
        config: &RemoteConfig,
    ) -> Self {
        let uuid = format!("remote-{}", Uuid::new_v4());
        let inner = RemoteInner {
            core: ChannelCore::new(uuid, config.priority, config.max_jobs, info),
            transport,
            host: host.into(),
            queue: BundleQueue::new(),
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            reconnect: tokio::sync::Mutex::new(()),
            policy: ReconnectPolicy::from_config(config),
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// 建立连接并启动发送与接收循环
    pub async fn connect(&self) -> GridResult<()> {
        let inner = &self.inner;
        inner.core.set_status(ConnectionStatus::Connecting);
        if inner.transport.is_closed() {
            if let Err(e) = inner.transport.reconnect().await {
                error!("通道 {} 连接失败: {}", inner.core.uuid(), e);
                inner.core.set_status(ConnectionStatus::Failed);
                return Err(e);
            }
        }
        let mut loops = sync::lock(&self.loops);
        if loops.is_empty() {
            loops.push(tokio::spawn(Arc::clone(inner).send_loop()));
            loops.push(tokio::spawn(Arc::clone(inner).receive_loop()));
        }
        drop(loops);
        inner.core.set_status(ConnectionStatus::Active);
        info!("远程通道 {} 已连接到 {}", inner.core.uuid(), inner.host);
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// 等待连接（或重连）完成，超时返回 false
    pub async fn await_working(&self, timeout: Duration) -> bool {
        self.inner.core.await_working(timeout).await
    }

    pub fn in_flight_count(&self) -> usize {
        sync::lock(&self.inner.in_flight).len()
    }
}

impl RemoteInner {
    async fn send_loop(self: Arc<Self>) {
        loop {
            let bundle = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.queue.pop() => match next {
                    Some(bundle) => bundle,
                    None => break,
                },
            };
            if bundle.is_ended() || bundle.is_cancelled() {
                debug!("任务束 {} 已取消，不再发送", bundle.id());
                continue;
            }
            let generation = self.generation.load(Ordering::Acquire);
            sync::lock(&self.in_flight).insert(bundle.id(), Arc::clone(&bundle));
            bundle.job_dispatched();
            metrics::bundle_dispatched(self.core.uuid(), bundle.task_count());
            debug!(
                "通道 {} 发送任务束 {} ({} 个任务)",
                self.core.uuid(),
                bundle.id(),
                bundle.task_count()
            );
            match self.transport.send(bundle.to_message()).await {
                Ok(ack) => {
                    if !ack.rejected.is_empty() {
                        warn!(
                            "通道 {} 拒收任务束 {} 中的 {} 个任务",
                            self.core.uuid(),
                            bundle.id(),
                            ack.rejected.len()
                        );
                        bundle.reject(&ack.rejected);
                    }
                }
                Err(e) if e.is_transient() => {
                    if sync::lock(&self.in_flight).remove(&bundle.id()).is_some() {
                        metrics::bundle_resubmitted(bundle.pending_count());
                        bundle.resubmit();
                        bundle.complete(Some(&e));
                    }
                    self.handle_failure(generation, e).await;
                }
                Err(e) => {
                    warn!("任务束 {} 无法发送: {}", bundle.id(), e);
                    sync::lock(&self.in_flight).remove(&bundle.id());
                    bundle.results_error(TaskError::new(TaskErrorKind::NotSerializable, e.to_string()));
                }
            }
        }
        debug!("通道 {} 发送循环退出", self.core.uuid());
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            let generation = self.generation.load(Ordering::Acquire);
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.transport.receive() => received,
            };
            match received {
                Ok(message) => self.results_received(message),
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    self.handle_failure(generation, e).await;
                    if self.core.status().is_terminated() {
                        break;
                    }
                }
            }
        }
        debug!("通道 {} 接收循环退出", self.core.uuid());
    }

    fn results_received(&self, message: ResultMessage) {
        let bundle = sync::lock(&self.in_flight).get(&message.bundle_id).cloned();
        let Some(bundle) = bundle else {
            debug!(
                "通道 {} 收到未知任务束 {} 的结果，已忽略",
                self.core.uuid(),
                message.bundle_id
            );
            return;
        };
        let accepted = bundle.results_received(message.tasks);
        debug!(
            "通道 {} 任务束 {} 返回 {} 个结果，剩余 {}",
            self.core.uuid(),
            bundle.id(),
            accepted,
            bundle.pending_count()
        );
        if accepted > 0 && bundle.is_ended() && !bundle.is_requeued() {
            let elapsed = bundle.elapsed();
            metrics::bundle_round_trip(elapsed);
            self.core.bundler().feedback(
                self.core.factory().as_deref(),
                self.core.uuid(),
                bundle.task_count(),
                elapsed,
            );
        }
    }

    /// 连接故障：先置为 DISCONNECTED，交还所有在途与排队的任务束，再按退避策略重连
    async fn handle_failure(&self, generation: u64, error: GridError) {
        let _guard = self.reconnect.lock().await;
        if self.generation.load(Ordering::Acquire) != generation
            || self.shutdown.is_cancelled()
            || self.core.status().is_terminated()
        {
            return;
        }
        warn!("通道 {} 连接故障: {}", self.core.uuid(), error);
        self.core.set_status(ConnectionStatus::Disconnected);
        self.resubmit_all(&error);

        self.core.set_status(ConnectionStatus::Connecting);
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            debug!(
                "通道 {} 第 {} 次重连，等待 {:?}",
                self.core.uuid(),
                attempt,
                delay
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.transport.reconnect().await {
                Ok(()) => {
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    info!("通道 {} 重连成功", self.core.uuid());
                    self.core.set_status(ConnectionStatus::Active);
                    return;
                }
                Err(e) => warn!("通道 {} 重连失败: {}", self.core.uuid(), e),
            }
        }
        error!(
            "通道 {} 重连 {} 次均失败",
            self.core.uuid(),
            self.policy.max_attempts
        );
        self.core.set_status(ConnectionStatus::Failed);
    }

    fn resubmit_all(&self, error: &GridError) {
        let mut bundles: Vec<Arc<ClientTaskBundle>> = sync::lock(&self.in_flight)
            .drain()
            .map(|(_, bundle)| bundle)
            .collect();
        bundles.extend(self.queue.drain());
        if bundles.is_empty() {
            return;
        }
        info!(
            "通道 {} 重新提交 {} 个任务束",
            self.core.uuid(),
            bundles.len()
        );
        for bundle in bundles {
            metrics::bundle_resubmitted(bundle.pending_count());
            bundle.resubmit();
            bundle.complete(Some(error));
        }
    }

    /// 任务束结束或被中断后释放并发位置
    async fn watch_bundle(self: Arc<Self>, bundle: Arc<ClientTaskBundle>) {
        let completion = bundle.completion_token();
        let cancel = bundle.cancel_token();
        tokio::select! {
            _ = completion.cancelled() => {}
            _ = cancel.cancelled() => {}
        }
        bundle.complete(None);
        sync::lock(&self.in_flight).remove(&bundle.id());
        self.core.job_finished();
    }
}

#[async_trait]
impl ExecutorChannel for RemoteChannel {
    fn uuid(&self) -> &str {
        self.inner.core.uuid()
    }

    fn priority(&self) -> i32 {
        self.inner.core.priority()
    }

    fn is_local(&self) -> bool {
        false
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.core.status()
    }

    fn system_information(&self) -> SystemInformation {
        self.inner.core.system_information()
    }

    fn management_info(&self) -> ManagementInfo {
        ManagementInfo::new(self.inner.core.uuid(), self.inner.host.clone(), false)
    }

    fn max_jobs(&self) -> usize {
        self.inner.core.max_jobs()
    }

    fn current_jobs(&self) -> usize {
        self.inner.core.current_jobs()
    }

    fn bundler(&self) -> &BundlerSlot {
        self.inner.core.bundler()
    }

    fn submit(&self, bundle: Arc<ClientTaskBundle>) -> GridResult<()> {
        let inner = &self.inner;
        if !inner.core.status().is_working() {
            return Err(GridError::ChannelClosed {
                uuid: inner.core.uuid().to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GridError::Internal(format!("没有可用的异步运行时: {e}")))?;
        inner.core.job_started();
        runtime.spawn(Arc::clone(inner).watch_bundle(Arc::clone(&bundle)));
        if !inner.queue.push(Arc::clone(&bundle)) {
            warn!("通道 {} 已关闭，任务束 {} 退回", inner.core.uuid(), bundle.id());
            bundle.resubmit();
            bundle.complete(Some(&GridError::ChannelClosed {
                uuid: inner.core.uuid().to_string(),
            }));
        }
        Ok(())
    }

    fn add_status_listener(&self, listener: StatusListener) {
        self.inner.core.add_listener(listener);
    }

    fn attach(&self, context: ChannelContext) {
        self.inner.core.attach(context);
    }

    async fn close(&self) {
        let inner = &self.inner;
        if inner.core.status() == ConnectionStatus::Closed {
            return;
        }
        info!("关闭远程通道 {}", inner.core.uuid());
        inner.shutdown.cancel();
        inner.queue.close();
        inner.resubmit_all(&GridError::ChannelClosed {
            uuid: inner.core.uuid().to_string(),
        });
        inner.transport.close().await;
        inner.core.set_status(ConnectionStatus::Closed);
        inner.core.bundler().dispose();
        let loops: Vec<JoinHandle<()>> = sync::lock(&self.loops).drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!("通道 {} 的循环任务异常退出: {}", inner.core.uuid(), e);
            }
        }
    }
}
