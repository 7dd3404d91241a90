use std::sync::Arc;
use std::time::Duration;

use grid_core::load_balancer::BundlerSlot;
use grid_core::models::ExecutorStatus;
use grid_core::traits::BundlerFactory;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ExecutorChannel;
use crate::job::{ClientJob, ClientTaskBundle};
use crate::metrics;
use crate::queue::JobQueue;
use crate::registry::ChannelRegistry;

/// 分发循环：把队列中的作业与空闲通道配对。
///
/// 由新作业入队、通道状态变化或周期心跳唤醒。
pub struct JobScheduler {
    queue: Arc<JobQueue>,
    registry: Arc<ChannelRegistry>,
    factory: Arc<dyn BundlerFactory>,
    wakeup: Arc<Notify>,
    tick: Duration,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<ChannelRegistry>,
        factory: Arc<dyn BundlerFactory>,
        wakeup: Arc<Notify>,
        tick: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            factory,
            wakeup,
            tick,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(self: Arc<Self>) {
        info!("作业调度器启动，心跳间隔 {:?}", self.tick);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            self.queue.process_pending_broadcasts(&self.working_channels());
            let dispatched = self.dispatch();
            if dispatched > 0 {
                debug!("本轮分发 {} 个任务束", dispatched);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("作业调度器收到停止信号");
                    break;
                }
                _ = self.wakeup.notified() => {}
                _ = ticker.tick() => {}
            }
        }
    }

    fn working_channels(&self) -> Vec<Arc<dyn ExecutorChannel>> {
        self.registry
            .all()
            .into_iter()
            .filter(|c| c.status().is_working())
            .collect()
    }

    /// 执行一轮分发直到没有可配对的作业与通道，返回分发的任务束数
    pub fn dispatch(&self) -> usize {
        let mut dispatched = 0;
        loop {
            self.registry.apply_refresh();
            let idle = match self.registry.highest_working_priority() {
                Some(priority) => self.registry.idle_channels(priority),
                None => break,
            };
            let mut progressed = false;
            for job in self.queue.jobs_in_order() {
                if job.is_broadcast_parent() || job.pending_task_count() == 0 {
                    continue;
                }
                let candidates = self.candidates_for(&job, &idle);
                if candidates.is_empty() {
                    continue;
                }
                let candidates = filter_preferred(&job, candidates);
                let Some(channel) = select_channel(&job, &candidates) else {
                    continue;
                };
                if self.dispatch_job_to_channel(&job, &channel) {
                    dispatched += 1;
                    progressed = true;
                    break;
                }
            }
            if !progressed {
                break;
            }
        }
        dispatched
    }

    /// 广播子作业只能使用绑定的通道，不受优先级限制
    fn candidates_for(
        &self,
        job: &ClientJob,
        idle: &[Arc<dyn ExecutorChannel>],
    ) -> Vec<Arc<dyn ExecutorChannel>> {
        match job.broadcast_channel() {
            Some(bound) => self
                .registry
                .get(bound)
                .filter(|c| c.execution_status() == ExecutorStatus::Active)
                .filter(|c| job.accepts_channel(c.uuid(), &c.system_information()))
                .into_iter()
                .collect(),
            None => idle
                .iter()
                .filter(|c| c.execution_status() == ExecutorStatus::Active)
                .filter(|c| job.accepts_channel(c.uuid(), &c.system_information()))
                .cloned()
                .collect(),
        }
    }

    /// 切片并提交；返回 false 表示本次没有发出任何任务
    pub fn dispatch_job_to_channel(
        &self,
        job: &Arc<ClientJob>,
        channel: &Arc<dyn ExecutorChannel>,
    ) -> bool {
        channel.check_bundler(self.factory.as_ref());
        let size = bundle_size(channel.bundler(), self.factory.as_ref())
            .min(job.sla().max_dispatch_size)
            .max(1);
        let Some(bundle) = self.queue.next_bundle(job, size, channel.uuid()) else {
            return false;
        };
        job.add_channel(channel.uuid());
        debug!(
            "作业 {} 的任务束 {} ({} 个任务) 分发到通道 {}",
            job.name(),
            bundle.id(),
            bundle.task_count(),
            channel.uuid()
        );
        self.schedule_expiration(job, &bundle);
        match channel.submit(Arc::clone(&bundle)) {
            Ok(()) => true,
            Err(e) => {
                warn!("通道 {} 提交任务束 {} 失败: {}", channel.uuid(), bundle.id(), e);
                bundle.resubmit();
                bundle.complete(Some(&e));
                self.registry.request_refresh(channel.uuid());
                false
            }
        }
    }

    fn schedule_expiration(&self, job: &ClientJob, bundle: &Arc<ClientTaskBundle>) {
        let Some(timeout) = job.sla().dispatch_expiration else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let max_expirations = job.sla().max_dispatch_expirations;
        let bundle = Arc::clone(bundle);
        let completion = bundle.completion_token();
        runtime.spawn(async move {
            tokio::select! {
                _ = completion.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    metrics::dispatch_expired();
                    bundle.expire(max_expirations);
                }
            }
        });
    }
}

fn bundle_size(slot: &BundlerSlot, factory: &dyn BundlerFactory) -> usize {
    slot.bundle_size()
        .unwrap_or_else(|| factory.fallback_bundler().bundle_size())
}

/// 取第一个至少匹配一个候选通道的偏好策略的匹配结果
fn filter_preferred(
    job: &ClientJob,
    candidates: Vec<Arc<dyn ExecutorChannel>>,
) -> Vec<Arc<dyn ExecutorChannel>> {
    for policy in &job.sla().preference {
        let matching: Vec<Arc<dyn ExecutorChannel>> = candidates
            .iter()
            .filter(|c| policy.accepts(&c.system_information()))
            .cloned()
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    candidates
}

/// 优先选择其他作业分发最少的通道，相同时按空闲先后
fn select_channel(
    job: &ClientJob,
    candidates: &[Arc<dyn ExecutorChannel>],
) -> Option<Arc<dyn ExecutorChannel>> {
    candidates
        .iter()
        .min_by_key(|c| {
            c.current_jobs()
                .saturating_sub(job.channel_dispatch_count(c.uuid()))
        })
        .cloned()
}
