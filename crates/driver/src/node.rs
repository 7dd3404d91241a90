use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use grid_core::errors::{GridError, GridResult};
use grid_core::load_balancer::BundlerSlot;
use grid_core::models::management::{HOST_PROPERTY, PROCESSORS_PROPERTY};
use grid_core::models::{ConnectionStatus, SystemInformation, Task, TaskError};
use grid_core::sync;
use grid_core::traits::TaskRunner;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bundle_node::ServerTaskBundleNode;

/// 驱动端连接的执行节点
#[async_trait]
pub trait NodeChannel: Send + Sync {
    fn uuid(&self) -> &str;

    fn status(&self) -> ConnectionStatus;

    fn system_information(&self) -> SystemInformation;

    fn host(&self) -> String {
        self.system_information()
            .get(HOST_PROPERTY)
            .unwrap_or("localhost")
            .to_string()
    }

    fn bundler(&self) -> &BundlerSlot;

    /// 执行一次分发，返回全部任务；被中断时未执行的任务保持 PENDING
    async fn execute(&self, bundle: Arc<ServerTaskBundleNode>) -> GridResult<Vec<Task>>;

    async fn close(&self);
}

/// 在驱动端进程内执行任务的节点
pub struct LocalNode {
    uuid: String,
    runner: Arc<dyn TaskRunner>,
    threads: usize,
    info: SystemInformation,
    status: RwLock<ConnectionStatus>,
    bundler: BundlerSlot,
}

impl LocalNode {
    pub fn new(runner: Arc<dyn TaskRunner>, threads: usize) -> Self {
        let threads = threads.max(1);
        let uuid = format!("node-{}", Uuid::new_v4());
        let mut info = SystemInformation::local();
        info.set_property(PROCESSORS_PROPERTY, threads.to_string());
        info!("本地节点 {} 已创建，并发: {}", uuid, threads);
        Self {
            uuid,
            runner,
            threads,
            info,
            status: RwLock::new(ConnectionStatus::Active),
            bundler: BundlerSlot::new(),
        }
    }

    /// 追加能力描述属性，供执行策略匹配
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.set_property(key, value);
        self
    }
}

#[async_trait]
impl NodeChannel for LocalNode {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn status(&self) -> ConnectionStatus {
        *sync::read(&self.status)
    }

    fn system_information(&self) -> SystemInformation {
        self.info.clone()
    }

    fn bundler(&self) -> &BundlerSlot {
        &self.bundler
    }

    async fn execute(&self, bundle: Arc<ServerTaskBundleNode>) -> GridResult<Vec<Task>> {
        if !self.status().is_working() {
            return Err(GridError::ChannelClosed {
                uuid: self.uuid.clone(),
            });
        }
        let cancel = bundle.cancel_token();
        let mut remaining: BTreeMap<usize, Task> =
            bundle.tasks().iter().map(|t| (t.position(), t.clone())).collect();
        let results = stream::iter(bundle.tasks().to_vec())
            .map(|task| run_task(Arc::clone(&self.runner), task))
            .buffer_unordered(self.threads);
        tokio::pin!(results);

        let mut done = Vec::with_capacity(remaining.len());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("节点 {} 中断分发 {}", self.uuid, bundle.id());
                    break;
                }
                next = results.next() => match next {
                    Some(task) => {
                        remaining.remove(&task.position());
                        done.push(task);
                    }
                    None => break,
                }
            }
        }
        done.extend(remaining.into_values());
        Ok(done)
    }

    async fn close(&self) {
        *sync::write(&self.status) = ConnectionStatus::Closed;
        self.bundler.dispose();
        info!("本地节点 {} 已关闭", self.uuid);
    }
}

async fn run_task(runner: Arc<dyn TaskRunner>, task: Task) -> Task {
    let mut fallback = task.clone();
    let handle = tokio::spawn(async move {
        let mut task = task;
        runner.run(&task).await.apply(&mut task);
        task
    });
    match handle.await {
        Ok(task) => task,
        Err(e) => {
            error!("节点任务 {} 执行异常终止: {}", fallback.position(), e);
            fallback.exception_received(TaskError::execution(format!("任务执行异常终止: {e}")));
            fallback
        }
    }
}
