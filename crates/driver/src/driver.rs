use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grid_core::config::DriverConfig;
use grid_core::errors::{GridError, GridResult};
use grid_core::load_balancer::LoadBalancerFactory;
use grid_core::models::management::PROCESSORS_PROPERTY;
use grid_core::models::{BundleMessage, SendAck, SystemInformation};
use grid_core::sync;
use grid_core::traits::{JobListener, JobNotifier, TaskRunner};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bundle_client::ClientBundleListener;
use crate::dispatcher::NodeDispatcher;
use crate::job::ServerJob;
use crate::node::{LocalNode, NodeChannel};
use crate::queue::DriverQueue;

/// 驱动端入口：接收客户端任务束，分发到节点，把结果按客户端任务束回传
pub struct Driver {
    uuid: String,
    config: DriverConfig,
    queue: Arc<DriverQueue>,
    dispatcher: Arc<NodeDispatcher>,
    factory: Arc<LoadBalancerFactory>,
    notifier: Arc<JobNotifier>,
    closed: AtomicBool,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    pub fn new(config: &DriverConfig) -> GridResult<Self> {
        let factory = Arc::new(LoadBalancerFactory::new(config.load_balancing.clone())?);
        let notifier = Arc::new(JobNotifier::new());
        let wakeup = Arc::new(Notify::new());
        let queue = DriverQueue::new(Arc::clone(&notifier), Arc::clone(&wakeup));
        let dispatcher = Arc::new(NodeDispatcher::new(
            Arc::clone(&queue),
            factory.clone(),
            wakeup,
            Duration::from_millis(config.tick_interval_ms),
        ));
        let uuid = format!("driver-{}", Uuid::new_v4());
        info!("驱动端 {} 已创建", uuid);
        Ok(Self {
            uuid,
            config: config.clone(),
            queue,
            dispatcher,
            factory,
            notifier,
            closed: AtomicBool::new(false),
            dispatcher_task: Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn factory(&self) -> &Arc<LoadBalancerFactory> {
        &self.factory
    }

    pub fn queue(&self) -> &Arc<DriverQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<NodeDispatcher> {
        &self.dispatcher
    }

    /// 按配置创建本地节点，返回节点 uuid
    pub fn add_local_nodes(&self, runner: Arc<dyn TaskRunner>) -> GridResult<Vec<String>> {
        (0..self.config.nodes)
            .map(|_| {
                let node = Arc::new(LocalNode::new(Arc::clone(&runner), self.config.node_threads));
                let uuid = node.uuid().to_string();
                self.add_node(node)?;
                Ok(uuid)
            })
            .collect()
    }

    pub fn add_node(&self, node: Arc<dyn NodeChannel>) -> GridResult<()> {
        if self.is_closed() {
            return Err(GridError::ManagerClosed);
        }
        self.dispatcher.add_node(node)
    }

    pub async fn remove_node(&self, uuid: &str) -> GridResult<()> {
        self.dispatcher.remove_node(uuid).await
    }

    pub fn node_count(&self) -> usize {
        self.dispatcher.node_count()
    }

    /// 启动分发循环，需要在 tokio 运行时内调用
    pub fn start(&self) {
        let mut task = sync::lock(&self.dispatcher_task);
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(Arc::clone(&self.dispatcher).run()));
        info!("驱动端 {} 已启动，节点数: {}", self.uuid, self.node_count());
    }

    pub fn submit_bundle(
        &self,
        message: BundleMessage,
        listener: Arc<dyn ClientBundleListener>,
    ) -> GridResult<SendAck> {
        if self.is_closed() {
            return Err(GridError::ManagerClosed);
        }
        self.queue.add_bundle(message, listener)
    }

    pub fn job(&self, uuid: Uuid) -> Option<Arc<ServerJob>> {
        self.queue.job(uuid)
    }

    pub fn job_count(&self) -> usize {
        self.queue.job_count()
    }

    pub fn cancel_job(&self, uuid: Uuid) -> bool {
        self.queue.cancel_job(uuid)
    }

    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        self.notifier.add_listener(listener);
    }

    /// 驱动端整体的能力描述，处理器数为所有节点之和
    pub fn system_information(&self) -> SystemInformation {
        let processors: usize = self
            .dispatcher
            .nodes()
            .iter()
            .filter_map(|n| n.system_information().available_processors())
            .sum();
        let mut info = SystemInformation::local();
        info.set_property(PROCESSORS_PROPERTY, processors.max(1).to_string());
        info.set_property("driver_uuid", self.uuid.clone());
        info.set_property("nodes", self.node_count().to_string());
        info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 停止分发循环，取消所有作业并关闭节点
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("关闭驱动端 {}", self.uuid);
        self.dispatcher.stop();
        let task = sync::lock(&self.dispatcher_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("驱动端分发循环异常退出: {}", e);
            }
        }
        self.queue.close();
        self.dispatcher.close().await;
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("uuid", &self.uuid)
            .field("nodes", &self.node_count())
            .field("jobs", &self.job_count())
            .finish()
    }
}
