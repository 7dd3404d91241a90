use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grid_core::config::{AppConfig, ClientConfig};
use grid_core::errors::{GridError, GridResult};
use grid_core::load_balancer::LoadBalancerFactory;
use grid_core::models::{ConnectionStatus, Job};
use grid_core::sync;
use grid_core::traits::{JobListener, JobNotifier, TaskRunner};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelContext, ChannelStatusEvent, ExecutorChannel, LocalChannel};
use crate::job::{ClientJob, JobHandle};
use crate::metrics;
use crate::queue::JobQueue;
use crate::registry::ChannelRegistry;
use crate::scheduler::JobScheduler;

/// 提交端入口：持有作业队列、通道注册表与调度器
pub struct JobManager {
    queue: Arc<JobQueue>,
    registry: Arc<ChannelRegistry>,
    scheduler: Arc<JobScheduler>,
    factory: Arc<LoadBalancerFactory>,
    notifier: Arc<JobNotifier>,
    wakeup: Arc<Notify>,
    closed: AtomicBool,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(config: &AppConfig) -> GridResult<Self> {
        let factory = Arc::new(LoadBalancerFactory::new(config.load_balancing.clone())?);
        Ok(Self::with_factory(
            factory,
            Duration::from_millis(config.scheduler.tick_interval_ms),
        ))
    }

    pub fn with_factory(factory: Arc<LoadBalancerFactory>, tick: Duration) -> Self {
        let wakeup = Arc::new(Notify::new());
        let queue = JobQueue::new(Arc::clone(&wakeup));
        let registry = Arc::new(ChannelRegistry::new());
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            factory.clone(),
            Arc::clone(&wakeup),
            tick,
        ));
        Self {
            queue,
            registry,
            scheduler,
            factory,
            notifier: Arc::new(JobNotifier::new()),
            wakeup,
            closed: AtomicBool::new(false),
            scheduler_task: Mutex::new(None),
        }
    }

    /// 启动调度循环，需要在 tokio 运行时内调用
    pub fn start(&self) {
        let mut task = sync::lock(&self.scheduler_task);
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(Arc::clone(&self.scheduler).run()));
        info!("作业管理器已启动");
    }

    pub fn factory(&self) -> &Arc<LoadBalancerFactory> {
        &self.factory
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn channels(&self) -> Vec<Arc<dyn ExecutorChannel>> {
        self.registry.all()
    }

    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        self.notifier.add_listener(listener);
    }

    /// 按客户端配置创建并注册本地通道
    pub fn add_local_channel(
        &self,
        runner: Arc<dyn TaskRunner>,
        config: &ClientConfig,
    ) -> GridResult<Arc<LocalChannel>> {
        let channel = Arc::new(LocalChannel::new(
            runner,
            config.local_threads,
            config.local_priority,
            config.local_max_jobs,
        ));
        self.add_channel(channel.clone())?;
        Ok(channel)
    }

    pub fn add_channel(&self, channel: Arc<dyn ExecutorChannel>) -> GridResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GridError::ManagerClosed);
        }
        channel.attach(ChannelContext {
            wakeup: Arc::clone(&self.wakeup),
            factory: self.factory.clone(),
        });
        let queue = Arc::downgrade(&self.queue);
        let registry = Arc::downgrade(&self.registry);
        channel.add_status_listener(Arc::new(move |event: &ChannelStatusEvent| {
            if let (Some(queue), Some(registry)) = (queue.upgrade(), registry.upgrade()) {
                update_connection_status(&queue, &registry, event);
            }
        }));
        let uuid = channel.uuid().to_string();
        self.registry.add(channel)?;
        metrics::channel_count(self.registry.len());
        info!("注册执行通道 {}", uuid);
        self.wakeup.notify_one();
        Ok(())
    }

    pub async fn remove_channel(&self, uuid: &str) -> GridResult<()> {
        let channel = self
            .registry
            .remove(uuid)
            .ok_or_else(|| GridError::ChannelNotFound {
                uuid: uuid.to_string(),
            })?;
        channel.close().await;
        self.queue.cancel_broadcast_jobs(uuid);
        metrics::channel_count(self.registry.len());
        info!("移除执行通道 {}", uuid);
        Ok(())
    }

    /// 提交作业，返回可等待结果的句柄
    pub fn submit(&self, job: Job) -> GridResult<JobHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GridError::ManagerClosed);
        }
        let mut positions = HashSet::with_capacity(job.tasks.len());
        for task in &job.tasks {
            if !positions.insert(task.position()) {
                return Err(GridError::DuplicateTaskPosition {
                    job: job.uuid,
                    position: task.position(),
                });
            }
        }
        if let Some(graph) = &job.task_graph {
            graph.validate(job.task_count())?;
        }
        info!(
            "提交作业 {} ({})，任务数: {}，优先级: {}",
            job.name,
            job.uuid,
            job.task_count(),
            job.sla.priority
        );
        let client = ClientJob::new(job, Arc::clone(&self.notifier));
        let weak = Arc::downgrade(&client);
        client.add_on_done(move || {
            let cancelled = weak.upgrade().is_some_and(|job| job.is_cancelled());
            metrics::job_ended(cancelled);
        });
        self.queue.add_job(Arc::clone(&client), &self.registry.all())?;
        metrics::job_submitted();
        Ok(JobHandle::new(client))
    }

    pub fn job(&self, uuid: Uuid) -> Option<JobHandle> {
        self.queue.job(uuid).map(JobHandle::new)
    }

    pub fn cancel_job(&self, uuid: Uuid) -> bool {
        self.queue.cancel_job(uuid)
    }

    pub fn update_priority(&self, uuid: Uuid, priority: i32) -> bool {
        self.queue.update_priority(uuid, priority)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 停止调度循环，取消排队中的作业并关闭所有通道
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("关闭作业管理器");
        self.scheduler.stop();
        let task = sync::lock(&self.scheduler_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("调度循环异常退出: {}", e);
            }
        }
        self.queue.close();
        for channel in self.registry.all() {
            channel.close().await;
        }
    }
}

/// 通道状态监听：刷新空闲集合；断开或终止时强制完成绑定的广播子作业
fn update_connection_status(queue: &JobQueue, registry: &ChannelRegistry, event: &ChannelStatusEvent) {
    registry.request_refresh(&event.channel_uuid);
    match event.new_status {
        ConnectionStatus::Disconnected | ConnectionStatus::Failed | ConnectionStatus::Closed => {
            debug!(
                "通道 {} 不再可用 ({} -> {})",
                event.channel_uuid, event.old_status, event.new_status
            );
            queue.cancel_broadcast_jobs(&event.channel_uuid);
        }
        _ => {}
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("channels", &self.registry.len())
            .field("queued", &self.queue.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

