use async_trait::async_trait;

use crate::errors::GridResult;
use crate::models::{BundleMessage, ResultMessage, SendAck};

/// 远程通道使用的传输层；帧格式与序列化由实现决定
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送一个任务束，返回对端无法接收的任务
    async fn send(&self, bundle: BundleMessage) -> GridResult<SendAck>;

    /// 阻塞直到收到下一批结果
    async fn receive(&self) -> GridResult<ResultMessage>;

    fn is_closed(&self) -> bool;

    async fn close(&self);

    /// 重新建立连接
    async fn reconnect(&self) -> GridResult<()>;
}
