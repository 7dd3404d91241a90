use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::GridResult;

/// 任务状态；只能沿 PENDING → {RESULT | EXCEPTION | CANCELLED} 或
/// PENDING → RESUBMIT → PENDING 前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Resubmit,
    Exception,
    Result,
    Cancelled,
}

impl TaskState {
    /// 序号不小于 EXCEPTION 即视为已完成
    pub fn is_done(self) -> bool {
        self >= TaskState::Exception
    }
}

/// 不透明的序列化负载，克隆时共享同一份字节。
///
/// `id` 随负载一起序列化，跨进程传输后仍能识别是否为同一份负载。
#[derive(Clone, Serialize, Deserialize)]
pub struct Payload {
    id: Uuid,
    bytes: Arc<Vec<u8>>,
}

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes: Arc::new(bytes),
        }
    }

    pub fn from_json<T: Serialize>(value: &T) -> GridResult<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn to_json<T: DeserializeOwned>(&self) -> GridResult<T> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 是否为同一份负载，内容相同的不同负载不算
    pub fn is_same(&self, other: &Payload) -> bool {
        self.id == other.id
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Payload {}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.bytes.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Execution,
    NotSerializable,
    ResubmitLimitExceeded,
    ChannelFailure,
    Rejected,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskErrorKind::Execution => "execution",
            TaskErrorKind::NotSerializable => "not_serializable",
            TaskErrorKind::ResubmitLimitExceeded => "resubmit_limit_exceeded",
            TaskErrorKind::ChannelFailure => "channel_failure",
            TaskErrorKind::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// 任务级别的失败，随任务一起返回给提交者
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Execution, message)
    }

    pub fn channel_failure(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::ChannelFailure, message)
    }
}

/// 重提交次数耗尽后的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResubmitExhaustedPolicy {
    /// 强制置为 EXCEPTION
    #[default]
    Fail,
    /// 保留最后一次结果；没有结果时同 Fail
    AcceptLast,
}

/// 一个任务：稳定的位置、状态、输入负载与结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    position: usize,
    state: TaskState,
    payload: Payload,
    result: Option<Payload>,
    error: Option<TaskError>,
    expiration_count: u32,
    resubmit_count: u32,
    max_resubmits: Option<u32>,
}

impl Task {
    pub fn new(position: usize, payload: impl Into<Payload>) -> Self {
        Self {
            position,
            state: TaskState::Pending,
            payload: payload.into(),
            result: None,
            error: None,
            expiration_count: 0,
            resubmit_count: 0,
            max_resubmits: None,
        }
    }

    /// 覆盖SLA中的最大重提交次数
    pub fn with_max_resubmits(mut self, max_resubmits: u32) -> Self {
        self.max_resubmits = Some(max_resubmits);
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn result(&self) -> Option<&Payload> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn expiration_count(&self) -> u32 {
        self.expiration_count
    }

    pub fn resubmit_count(&self) -> u32 {
        self.resubmit_count
    }

    pub fn max_resubmits(&self) -> Option<u32> {
        self.max_resubmits
    }

    /// 收到执行结果；结果与初始负载为同一引用时视为已取消
    pub fn result_received(&mut self, result: Payload) -> bool {
        if self.state.is_done() {
            return false;
        }
        self.state = if result.is_same(&self.payload) {
            TaskState::Cancelled
        } else {
            TaskState::Result
        };
        self.result = Some(result);
        self.error = None;
        true
    }

    /// 收到执行异常，清除结果
    pub fn exception_received(&mut self, error: TaskError) -> bool {
        if self.state.is_done() {
            return false;
        }
        self.state = TaskState::Exception;
        self.result = None;
        self.error = Some(error);
        true
    }

    /// 取消任务，以原始负载作为占位结果；已完成的任务返回 false
    pub fn cancel(&mut self) -> bool {
        if self.state.is_done() {
            return false;
        }
        self.state = TaskState::Cancelled;
        self.result = Some(self.payload.clone());
        self.error = None;
        true
    }

    /// 标记为需要重新提交
    pub fn mark_resubmit(&mut self) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Resubmit;
        true
    }

    /// RESUBMIT → PENDING，不消耗重提交预算（通道故障）
    pub fn restore_pending(&mut self) -> bool {
        if self.state != TaskState::Resubmit {
            return false;
        }
        self.state = TaskState::Pending;
        true
    }

    /// RESUBMIT → PENDING 并计入重提交次数。
    ///
    /// 返回 true 表示任务重新进入待分发池；预算耗尽时按 `policy`
    /// 强制为终态并返回 false。
    pub fn resubmit(&mut self, sla_max_resubmits: u32, policy: ResubmitExhaustedPolicy) -> bool {
        if self.state != TaskState::Resubmit {
            return false;
        }
        let max = self.max_resubmits.unwrap_or(sla_max_resubmits);
        if self.resubmit_count < max {
            self.resubmit_count += 1;
            self.state = TaskState::Pending;
            return true;
        }
        match (policy, self.result.clone()) {
            (ResubmitExhaustedPolicy::AcceptLast, Some(last)) => {
                self.state = TaskState::Result;
                self.result = Some(last);
                self.error = None;
            }
            _ => {
                self.state = TaskState::Exception;
                self.result = None;
                self.error = Some(TaskError::new(
                    TaskErrorKind::ResubmitLimitExceeded,
                    format!("任务 {} 已达到最大重提交次数 {}", self.position, max),
                ));
            }
        }
        false
    }

    /// 分发超时计数加一，返回新的计数
    pub fn increment_expiration(&mut self) -> u32 {
        self.expiration_count += 1;
        self.expiration_count
    }

    /// 执行端请求重新提交，可附带本次的中间结果
    pub fn request_resubmit(&mut self, partial: Option<Payload>) -> bool {
        if self.state.is_done() {
            return false;
        }
        if partial.is_some() {
            self.result = partial;
        }
        self.state = TaskState::Resubmit;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_with_initial_payload_means_cancelled() {
        let mut task = Task::new(0, "input");
        let same = task.payload().clone();
        assert!(task.result_received(same));
        assert_eq!(task.state(), TaskState::Cancelled);

        let mut other = Task::new(1, "input");
        assert!(other.result_received(Payload::from("input")));
        assert_eq!(other.state(), TaskState::Result);
    }

    #[test]
    fn test_initial_payload_recognised_after_json_round_trip() {
        let mut task = Task::new(0, "input");
        let json = serde_json::to_string(task.payload()).unwrap();
        let echoed: Payload = serde_json::from_str(&json).unwrap();
        assert!(echoed.is_same(task.payload()));
        assert!(task.result_received(echoed));
        assert_eq!(task.state(), TaskState::Cancelled);

        let json = serde_json::to_string(&Task::new(1, "x")).unwrap();
        let mut shipped: Task = serde_json::from_str(&json).unwrap();
        let placeholder = shipped.payload().clone();
        assert!(shipped.result_received(placeholder));
        assert_eq!(shipped.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_exception_clears_result() {
        let mut task = Task::new(0, "x");
        task.request_resubmit(Some(Payload::from("partial")));
        task.restore_pending();
        assert!(task.exception_received(TaskError::execution("boom")));
        assert_eq!(task.state(), TaskState::Exception);
        assert!(task.result().is_none());
        assert!(!task.result_received(Payload::from("late")));
    }

    #[test]
    fn test_cancel_only_once() {
        let mut task = Task::new(3, "x");
        assert!(task.cancel());
        assert!(!task.cancel());
        assert!(task.result().is_some_and(|r| r.is_same(task.payload())));
    }

    #[test]
    fn test_resubmit_budget_fail_policy() {
        let mut task = Task::new(0, "x");
        assert!(task.mark_resubmit());
        assert!(task.resubmit(1, ResubmitExhaustedPolicy::Fail));
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.resubmit_count(), 1);

        assert!(task.mark_resubmit());
        assert!(!task.resubmit(1, ResubmitExhaustedPolicy::Fail));
        assert_eq!(task.state(), TaskState::Exception);
        assert_eq!(
            task.error().map(|e| e.kind),
            Some(TaskErrorKind::ResubmitLimitExceeded)
        );
    }

    #[test]
    fn test_resubmit_budget_accept_last_policy() {
        let mut task = Task::new(0, "x").with_max_resubmits(0);
        assert!(task.request_resubmit(Some(Payload::from("last"))));
        assert!(!task.resubmit(5, ResubmitExhaustedPolicy::AcceptLast));
        assert_eq!(task.state(), TaskState::Result);
        assert_eq!(task.result(), Some(&Payload::from("last")));
    }

    #[test]
    fn test_restore_pending_keeps_budget() {
        let mut task = Task::new(0, "x");
        task.mark_resubmit();
        assert!(task.restore_pending());
        assert_eq!(task.resubmit_count(), 0);
        assert_eq!(task.state(), TaskState::Pending);
    }
}
