use thiserror::Error;
use uuid::Uuid;

/// 作业分发引擎错误类型定义
#[derive(Debug, Error)]
pub enum GridError {
    #[error("作业已结束: {uuid}")]
    JobAlreadyEnded { uuid: Uuid },

    #[error("作业 {job} 中的任务位置重复: {position}")]
    DuplicateTaskPosition { job: Uuid, position: usize },

    #[error("作业已在队列中: {uuid}")]
    JobAlreadyQueued { uuid: Uuid },

    #[error("作业未找到: {uuid}")]
    JobNotFound { uuid: Uuid },

    #[error("通道未找到: {uuid}")]
    ChannelNotFound { uuid: String },

    #[error("通道已关闭: {uuid}")]
    ChannelClosed { uuid: String },

    #[error("作业管理器已关闭")]
    ManagerClosed,

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("连接已断开: {0}")]
    Disconnected(String),

    #[error("无法序列化: {0}")]
    NotSerializable(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("检测到循环依赖")]
    CircularDependency,

    #[error("无效的任务依赖图: {0}")]
    InvalidTaskGraph(String),

    #[error("负载均衡错误: {0}")]
    LoadBalancer(String),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl GridError {
    /// 是否为可恢复的通道故障（重新提交并重连）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GridError::Transport(_) | GridError::Disconnected(_) | GridError::ChannelClosed { .. }
        )
    }
}

/// 统一的Result类型
pub type GridResult<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GridError::Transport("reset".into()).is_transient());
        assert!(GridError::Disconnected("eof".into()).is_transient());
        assert!(GridError::ChannelClosed { uuid: "c1".into() }.is_transient());
        assert!(!GridError::NotSerializable("socket".into()).is_transient());
        assert!(!GridError::JobAlreadyEnded { uuid: Uuid::new_v4() }.is_transient());
    }
}
