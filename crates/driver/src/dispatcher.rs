use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use grid_core::errors::{GridError, GridResult};
use grid_core::sync;
use grid_core::traits::BundlerFactory;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundle_node::ServerTaskBundleNode;
use crate::job::{BroadcastTarget, ServerJob};
use crate::metrics;
use crate::node::NodeChannel;
use crate::queue::DriverQueue;

/// 驱动端分发循环：把可分发的作业与空闲节点配对，每个节点同时只执行一次分发
pub struct NodeDispatcher {
    queue: Arc<DriverQueue>,
    /// 按注册顺序排列
    nodes: RwLock<Vec<Arc<dyn NodeChannel>>>,
    busy: Mutex<HashSet<String>>,
    factory: Arc<dyn BundlerFactory>,
    wakeup: Arc<Notify>,
    tick: Duration,
    shutdown: CancellationToken,
}

impl NodeDispatcher {
    pub fn new(
        queue: Arc<DriverQueue>,
        factory: Arc<dyn BundlerFactory>,
        wakeup: Arc<Notify>,
        tick: Duration,
    ) -> Self {
        Self {
            queue,
            nodes: RwLock::new(Vec::new()),
            busy: Mutex::new(HashSet::new()),
            factory,
            wakeup,
            tick,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn add_node(&self, node: Arc<dyn NodeChannel>) -> GridResult<()> {
        {
            let mut nodes = sync::write(&self.nodes);
            if nodes.iter().any(|n| n.uuid() == node.uuid()) {
                return Err(GridError::Internal(format!("节点 {} 已注册", node.uuid())));
            }
            info!("注册节点 {}", node.uuid());
            nodes.push(node);
        }
        metrics::node_count(self.node_count());
        self.wakeup.notify_one();
        Ok(())
    }

    /// 关闭并移除节点，绑定该节点的广播子作业强制完成
    pub async fn remove_node(&self, uuid: &str) -> GridResult<()> {
        let node = {
            let mut nodes = sync::write(&self.nodes);
            let index = nodes
                .iter()
                .position(|n| n.uuid() == uuid)
                .ok_or_else(|| GridError::ChannelNotFound {
                    uuid: uuid.to_string(),
                })?;
            nodes.remove(index)
        };
        node.close().await;
        self.queue.cancel_broadcast_jobs(uuid);
        metrics::node_count(self.node_count());
        info!("移除节点 {}", uuid);
        Ok(())
    }

    pub fn nodes(&self) -> Vec<Arc<dyn NodeChannel>> {
        sync::read(&self.nodes).clone()
    }

    pub fn node_count(&self) -> usize {
        sync::read(&self.nodes).len()
    }

    pub fn busy_count(&self) -> usize {
        sync::lock(&self.busy).len()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(self: Arc<Self>) {
        info!("驱动端分发循环启动，心跳间隔 {:?}", self.tick);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            self.queue.expand_broadcasts(&self.broadcast_targets());
            let dispatched = self.dispatch();
            if dispatched > 0 {
                debug!("驱动端本轮分发 {} 次", dispatched);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("驱动端分发循环收到停止信号");
                    break;
                }
                _ = self.wakeup.notified() => {}
                _ = ticker.tick() => {}
            }
        }
    }

    /// 可作为广播目标的节点
    pub fn broadcast_targets(&self) -> Vec<BroadcastTarget> {
        sync::read(&self.nodes)
            .iter()
            .filter(|n| n.status().is_working())
            .map(|n| BroadcastTarget {
                node_uuid: n.uuid().to_string(),
                host: n.host(),
                info: n.system_information(),
            })
            .collect()
    }

    fn idle_nodes(&self) -> Vec<Arc<dyn NodeChannel>> {
        let busy = sync::lock(&self.busy);
        sync::read(&self.nodes)
            .iter()
            .filter(|n| n.status().is_working() && !busy.contains(n.uuid()))
            .cloned()
            .collect()
    }

    /// 执行一轮分发直到没有可配对的作业与节点，返回发出的分发数
    pub fn dispatch(self: &Arc<Self>) -> usize {
        let mut dispatched = 0;
        loop {
            let idle = self.idle_nodes();
            if idle.is_empty() {
                break;
            }
            let mut progressed = false;
            for job in self.queue.jobs_in_order() {
                if job.is_broadcast_parent() || !job.has_ready_tasks() {
                    continue;
                }
                let candidates: Vec<Arc<dyn NodeChannel>> = idle
                    .iter()
                    .filter(|n| job.accepts_node(n.uuid(), &n.system_information()))
                    .cloned()
                    .collect();
                let Some(node) = preferred(&job, candidates).into_iter().next() else {
                    continue;
                };
                if self.dispatch_job_to_node(&job, &node) {
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

    fn dispatch_job_to_node(self: &Arc<Self>, job: &Arc<ServerJob>, node: &Arc<dyn NodeChannel>) -> bool {
        node.bundler()
            .check(self.factory.as_ref(), node.uuid(), &node.system_information());
        let size = node
            .bundler()
            .bundle_size()
            .unwrap_or_else(|| self.factory.fallback_bundler().bundle_size())
            .min(job.sla().max_dispatch_size)
            .max(1);
        if !sync::lock(&self.busy).insert(node.uuid().to_string()) {
            return false;
        }
        let Some(bundle) = self.queue.next_dispatch(job, size, node.uuid()) else {
            sync::lock(&self.busy).remove(node.uuid());
            return false;
        };
        debug!(
            "作业 {} 的分发 {} ({} 个任务) 交给节点 {}",
            job.name(),
            bundle.id(),
            bundle.task_count(),
            node.uuid()
        );
        tokio::spawn(Arc::clone(self).execute(Arc::clone(job), Arc::clone(node), bundle));
        true
    }

    async fn execute(
        self: Arc<Self>,
        job: Arc<ServerJob>,
        node: Arc<dyn NodeChannel>,
        bundle: Arc<ServerTaskBundleNode>,
    ) {
        job.job_dispatched(&bundle);
        metrics::node_dispatched(node.uuid(), bundle.task_count());
        match node.execute(Arc::clone(&bundle)).await {
            Ok(tasks) => {
                job.results_received(bundle.id(), tasks);
                if !bundle.is_cancelled() {
                    node.bundler().feedback(
                        Some(self.factory.as_ref()),
                        node.uuid(),
                        bundle.task_count(),
                        bundle.elapsed(),
                    );
                }
            }
            Err(e) => {
                warn!("节点 {} 执行分发 {} 失败: {}", node.uuid(), bundle.id(), e);
                metrics::node_dispatch_failed();
                job.results_error(bundle.id(), &e);
            }
        }
        sync::lock(&self.busy).remove(node.uuid());
        self.wakeup.notify_one();
    }

    pub async fn close(&self) {
        self.stop();
        let nodes: Vec<Arc<dyn NodeChannel>> = std::mem::take(&mut *sync::write(&self.nodes));
        for node in nodes {
            node.close().await;
        }
        metrics::node_count(0);
    }
}

/// 取第一个至少匹配一个候选节点的偏好策略的匹配结果
fn preferred(job: &ServerJob, candidates: Vec<Arc<dyn NodeChannel>>) -> Vec<Arc<dyn NodeChannel>> {
    for policy in &job.sla().preference {
        let matching: Vec<Arc<dyn NodeChannel>> = candidates
            .iter()
            .filter(|n| policy.accepts(&n.system_information()))
            .cloned()
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    candidates
}
