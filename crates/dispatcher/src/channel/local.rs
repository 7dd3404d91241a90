use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use grid_core::errors::{GridError, GridResult};
use grid_core::load_balancer::BundlerSlot;
use grid_core::models::management::{HOST_PROPERTY, PROCESSORS_PROPERTY};
use grid_core::models::{ConnectionStatus, ManagementInfo, SystemInformation, Task, TaskError};
use grid_core::traits::TaskRunner;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::shared::ChannelCore;
use super::{ChannelContext, ExecutorChannel, StatusListener};
use crate::job::ClientTaskBundle;
use crate::metrics;

/// 在当前进程内用 [`TaskRunner`] 执行任务的通道
pub struct LocalChannel {
    core: Arc<ChannelCore>,
    runner: Arc<dyn TaskRunner>,
    threads: usize,
    shutdown: CancellationToken,
}

impl LocalChannel {
    /// 创建后即为 ACTIVE
    pub fn new(runner: Arc<dyn TaskRunner>, threads: usize, priority: i32, max_jobs: usize) -> Self {
        let threads = threads.max(1);
        let uuid = format!("local-{}", Uuid::new_v4());
        let mut info = SystemInformation::local();
        info.set_property(PROCESSORS_PROPERTY, threads.to_string());
        let core = Arc::new(ChannelCore::new(uuid, priority, max_jobs, info));
        core.set_status(ConnectionStatus::Active);
        info!(
            "本地执行通道 {} 已创建，执行器: {}，并发: {}",
            core.uuid(),
            runner.name(),
            threads
        );
        Self {
            core,
            runner,
            threads,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// 执行一个任务束，结果逐个流式返回
async fn execute_bundle(
    core: Arc<ChannelCore>,
    runner: Arc<dyn TaskRunner>,
    threads: usize,
    bundle: Arc<ClientTaskBundle>,
    shutdown: CancellationToken,
) {
    bundle.job_dispatched();
    metrics::bundle_dispatched(core.uuid(), bundle.task_count());
    let cancel = bundle.cancel_token();
    let tasks = bundle.tasks_snapshot();
    let count = tasks.len();

    let results = stream::iter(tasks)
        .map(|task| run_task(Arc::clone(&runner), task))
        .buffer_unordered(threads);
    tokio::pin!(results);

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("本地通道 {} 中断任务束 {}", core.uuid(), bundle.id());
                interrupted = true;
                break;
            }
            _ = shutdown.cancelled() => {
                bundle.resubmit();
                interrupted = true;
                break;
            }
            next = results.next() => match next {
                Some(task) => {
                    bundle.results_received(vec![task]);
                }
                None => break,
            }
        }
    }

    let elapsed = bundle.elapsed();
    bundle.complete(None);
    if !interrupted {
        metrics::bundle_round_trip(elapsed);
        core.bundler()
            .feedback(core.factory().as_deref(), core.uuid(), count, elapsed);
    }
    core.job_finished();
}

/// 每个任务在独立的 tokio 任务中执行，执行器 panic 时任务以 EXCEPTION 返回
async fn run_task(runner: Arc<dyn TaskRunner>, task: Task) -> Task {
    let mut fallback = task.clone();
    let handle = tokio::spawn(async move {
        let mut task = task;
        let outcome = runner.run(&task).await;
        outcome.apply(&mut task);
        task
    });
    match handle.await {
        Ok(task) => task,
        Err(e) => {
            error!("任务 {} 执行异常终止: {}", fallback.position(), e);
            fallback.exception_received(TaskError::execution(format!("任务执行异常终止: {e}")));
            fallback
        }
    }
}

#[async_trait]
impl ExecutorChannel for LocalChannel {
    fn uuid(&self) -> &str {
        self.core.uuid()
    }

    fn priority(&self) -> i32 {
        self.core.priority()
    }

    fn is_local(&self) -> bool {
        true
    }

    fn status(&self) -> ConnectionStatus {
        self.core.status()
    }

    fn system_information(&self) -> SystemInformation {
        self.core.system_information()
    }

    fn management_info(&self) -> ManagementInfo {
        let info = self.core.system_information();
        let host = info.get(HOST_PROPERTY).unwrap_or("localhost").to_string();
        ManagementInfo::new(self.core.uuid(), host, true)
    }

    fn max_jobs(&self) -> usize {
        self.core.max_jobs()
    }

    fn current_jobs(&self) -> usize {
        self.core.current_jobs()
    }

    fn bundler(&self) -> &BundlerSlot {
        self.core.bundler()
    }

    fn submit(&self, bundle: Arc<ClientTaskBundle>) -> GridResult<()> {
        if !self.core.status().is_working() {
            return Err(GridError::ChannelClosed {
                uuid: self.core.uuid().to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GridError::Internal(format!("没有可用的异步运行时: {e}")))?;
        debug!(
            "本地通道 {} 接收任务束 {} ({} 个任务)",
            self.core.uuid(),
            bundle.id(),
            bundle.task_count()
        );
        self.core.job_started();
        runtime.spawn(execute_bundle(
            Arc::clone(&self.core),
            Arc::clone(&self.runner),
            self.threads,
            bundle,
            self.shutdown.clone(),
        ));
        Ok(())
    }

    fn add_status_listener(&self, listener: StatusListener) {
        self.core.add_listener(listener);
    }

    fn attach(&self, context: ChannelContext) {
        self.core.attach(context);
    }

    async fn close(&self) {
        if self.core.status() == ConnectionStatus::Closed {
            return;
        }
        info!("关闭本地执行通道 {}", self.core.uuid());
        self.shutdown.cancel();
        self.core.set_status(ConnectionStatus::Closed);
        self.core.bundler().dispose();
    }
}
