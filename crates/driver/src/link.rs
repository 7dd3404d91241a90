use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use grid_core::errors::{GridError, GridResult};
use grid_core::models::{BundleMessage, ResultMessage, SendAck, Task};
use grid_core::sync;
use grid_core::traits::Transport;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle_client::ClientBundleListener;
use crate::driver::Driver;

/// 把驱动端转发的结果写入连接的结果队列；连接断开后丢弃
struct LinkListener {
    results: mpsc::UnboundedSender<ResultMessage>,
    connection: CancellationToken,
}

impl ClientBundleListener for LinkListener {
    fn results_available(&self, bundle_id: u64, tasks: Vec<Task>) {
        if self.connection.is_cancelled() {
            debug!("连接已断开，丢弃任务束 {} 的 {} 个结果", bundle_id, tasks.len());
            return;
        }
        if self.results.send(ResultMessage { bundle_id, tasks }).is_err() {
            debug!("结果队列已关闭，丢弃任务束 {} 的结果", bundle_id);
        }
    }
}

/// 进程内传输：客户端远程通道经此与 [`Driver`] 相连。
///
/// 任务束与结果都经过一次 JSON 编解码，与跨进程传输的序列化边界一致。
pub struct DriverLink {
    driver: Arc<Driver>,
    results_tx: mpsc::UnboundedSender<ResultMessage>,
    results_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ResultMessage>>,
    connection: RwLock<CancellationToken>,
    /// 经本连接提交的驱动端作业
    jobs: Mutex<HashSet<Uuid>>,
    closed: AtomicBool,
}

impl DriverLink {
    pub fn new(driver: Arc<Driver>) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            driver,
            results_tx,
            results_rx: tokio::sync::Mutex::new(results_rx),
            connection: RwLock::new(CancellationToken::new()),
            jobs: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// 模拟连接中断：等待中的接收立即失败，驱动端取消经本连接提交的作业
    pub fn disconnect(&self) {
        let token = sync::read(&self.connection).clone();
        if token.is_cancelled() {
            return;
        }
        warn!("与驱动端 {} 的连接中断", self.driver.uuid());
        token.cancel();
        let jobs: Vec<Uuid> = sync::lock(&self.jobs).drain().collect();
        for uuid in jobs {
            self.driver.cancel_job(uuid);
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !sync::read(&self.connection).is_cancelled()
    }

    fn current_connection(&self) -> GridResult<CancellationToken> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GridError::Disconnected(format!(
                "与驱动端 {} 的连接已关闭",
                self.driver.uuid()
            )));
        }
        let token = sync::read(&self.connection).clone();
        if token.is_cancelled() {
            return Err(GridError::Disconnected(format!(
                "与驱动端 {} 的连接已断开",
                self.driver.uuid()
            )));
        }
        Ok(token)
    }
}

#[async_trait]
impl Transport for DriverLink {
    async fn send(&self, bundle: BundleMessage) -> GridResult<SendAck> {
        let connection = self.current_connection()?;
        let bytes = serde_json::to_vec(&bundle)?;
        let message: BundleMessage = serde_json::from_slice(&bytes)?;
        let job_uuid = message.header.job_uuid;
        let listener = Arc::new(LinkListener {
            results: self.results_tx.clone(),
            connection,
        });
        let ack = self.driver.submit_bundle(message, listener).map_err(|e| match e {
            GridError::ManagerClosed => {
                GridError::Transport(format!("驱动端 {} 已关闭", self.driver.uuid()))
            }
            other => other,
        })?;
        sync::lock(&self.jobs).insert(job_uuid);
        Ok(ack)
    }

    async fn receive(&self) -> GridResult<ResultMessage> {
        let connection = self.current_connection()?;
        let mut results = self.results_rx.lock().await;
        tokio::select! {
            _ = connection.cancelled() => Err(GridError::Disconnected(format!(
                "与驱动端 {} 的连接已断开",
                self.driver.uuid()
            ))),
            message = results.recv() => {
                let message = message.ok_or_else(|| {
                    GridError::Disconnected("结果队列已关闭".to_string())
                })?;
                let bytes = serde_json::to_vec(&message)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    fn is_closed(&self) -> bool {
        !self.is_connected()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        sync::read(&self.connection).cancel();
        info!("关闭与驱动端 {} 的连接", self.driver.uuid());
    }

    async fn reconnect(&self) -> GridResult<()> {
        if self.closed.load(Ordering::Acquire) || self.driver.is_closed() {
            return Err(GridError::Transport(format!(
                "驱动端 {} 不可用",
                self.driver.uuid()
            )));
        }
        // 旧连接上的结果只会对应已重新提交的任务束，远程通道按任务束 id 忽略
        let old = std::mem::replace(&mut *sync::write(&self.connection), CancellationToken::new());
        old.cancel();
        info!("已重新连接驱动端 {}", self.driver.uuid());
        Ok(())
    }
}
