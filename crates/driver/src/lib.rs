//! 驱动端作业处理
//!
//! 客户端任务束经 [`Driver`] 合并为 [`ServerJob`]，[`NodeDispatcher`] 把作业
//! 切分给空闲节点执行，结果按发送策略回传给各自的客户端任务束。
//! [`DriverLink`] 是连接客户端远程通道与驱动端的进程内传输。

pub mod bundle_client;
pub mod bundle_node;
pub mod dispatcher;
pub mod driver;
pub mod job;
pub mod link;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod send_strategy;

pub use bundle_client::{ClientBundleListener, ServerTaskBundleClient};
pub use bundle_node::ServerTaskBundleNode;
pub use dispatcher::NodeDispatcher;
pub use driver::Driver;
pub use job::{BroadcastTarget, ServerJob};
pub use link::DriverLink;
pub use node::{LocalNode, NodeChannel};
pub use queue::DriverQueue;
pub use send_strategy::{strategy_for, AllResults, NTasks, NodeResults, SendStrategy};
