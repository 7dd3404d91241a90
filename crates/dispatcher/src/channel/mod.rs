//! 执行通道
//!
//! 调度器只通过 [`ExecutorChannel`] 与执行目标交互：本地进程内执行
//! ([`LocalChannel`]) 与经由 [`Transport`](grid_core::traits::Transport) 的远程执行
//! ([`RemoteChannel`]) 是同一接口的两种实现。

mod bundle_queue;
mod local;
mod remote;
mod shared;

use std::sync::Arc;

use async_trait::async_trait;
use grid_core::errors::GridResult;
use grid_core::load_balancer::BundlerSlot;
use grid_core::models::{ConnectionStatus, ExecutorStatus, ManagementInfo, SystemInformation};
use grid_core::traits::BundlerFactory;
use tokio::sync::Notify;

use crate::job::ClientTaskBundle;

pub use self::bundle_queue::BundleQueue;
pub use self::local::LocalChannel;
pub use self::remote::{ReconnectPolicy, RemoteChannel};
pub use self::shared::ChannelCore;

/// 通道状态变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatusEvent {
    pub channel_uuid: String,
    pub old_status: ConnectionStatus,
    pub new_status: ConnectionStatus,
}

pub type StatusListener = Arc<dyn Fn(&ChannelStatusEvent) + Send + Sync>;

/// 通道注册到作业管理器时获得的运行上下文
#[derive(Clone)]
pub struct ChannelContext {
    /// 容量释放或状态变化时唤醒调度器
    pub wakeup: Arc<Notify>,
    pub factory: Arc<dyn BundlerFactory>,
}

#[async_trait]
pub trait ExecutorChannel: Send + Sync {
    fn uuid(&self) -> &str;

    /// 优先级越高越先被使用
    fn priority(&self) -> i32;

    fn is_local(&self) -> bool;

    fn status(&self) -> ConnectionStatus;

    fn execution_status(&self) -> ExecutorStatus {
        self.status().executor_status()
    }

    fn system_information(&self) -> SystemInformation;

    fn management_info(&self) -> ManagementInfo;

    /// 可同时服务的任务束数
    fn max_jobs(&self) -> usize;

    fn current_jobs(&self) -> usize;

    fn bundler(&self) -> &BundlerSlot;

    /// 负载均衡器缺失或过期时按工厂配置重建
    fn check_bundler(&self, factory: &dyn BundlerFactory) {
        self.bundler()
            .check(factory, self.uuid(), &self.system_information());
    }

    /// 异步发送任务束；结果通过任务束回传给作业
    fn submit(&self, bundle: Arc<ClientTaskBundle>) -> GridResult<()>;

    fn add_status_listener(&self, listener: StatusListener);

    fn attach(&self, context: ChannelContext);

    async fn close(&self);
}
