//! 提交端作业分发
//!
//! 作业经 [`JobManager`] 进入优先级队列，[`JobScheduler`] 把作业切成任务束
//! 分发给空闲的 [`ExecutorChannel`]，结果按任务束回传并合并到作业结果集。

pub mod channel;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod scheduler;

pub use channel::{
    ChannelContext, ChannelStatusEvent, ExecutorChannel, LocalChannel, ReconnectPolicy,
    RemoteChannel, StatusListener,
};
pub use job::{ClientJob, ClientTaskBundle, JobHandle};
pub use manager::JobManager;
pub use queue::JobQueue;
pub use registry::ChannelRegistry;
pub use scheduler::JobScheduler;
