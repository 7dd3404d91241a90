use std::fmt;

use serde::{Deserialize, Serialize};

/// 通道连接状态；CLOSED/FAILED/DISCONNECTED 对同一连接实例为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    New,
    Connecting,
    Active,
    Executing,
    Failed,
    Closed,
    Disconnected,
}

impl ConnectionStatus {
    /// 可以接收任务的状态
    pub fn is_working(self) -> bool {
        matches!(self, ConnectionStatus::Active | ConnectionStatus::Executing)
    }

    pub fn is_terminated(self) -> bool {
        matches!(self, ConnectionStatus::Failed | ConnectionStatus::Closed)
    }

    pub fn executor_status(self) -> ExecutorStatus {
        match self {
            ConnectionStatus::Active => ExecutorStatus::Active,
            ConnectionStatus::Executing => ExecutorStatus::Executing,
            ConnectionStatus::Failed | ConnectionStatus::Closed => ExecutorStatus::Failed,
            _ => ExecutorStatus::Disabled,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// 调度器看到的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorStatus {
    Active,
    Executing,
    Failed,
    Disabled,
}
