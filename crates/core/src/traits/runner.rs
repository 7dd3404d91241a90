//! 任务执行接口
//!
//! 本地通道与驱动端本地节点都通过 [`TaskRunner`] 执行任务负载。
//!
//! ```ignore
//! use grid_core::traits::{FnRunner, TaskOutcome};
//! use grid_core::models::Payload;
//!
//! let runner = FnRunner::new("upper", |task| {
//!     let text = String::from_utf8_lossy(task.payload().as_bytes()).to_uppercase();
//!     TaskOutcome::Completed(Payload::from(text.as_str()))
//! });
//! ```

use async_trait::async_trait;

use crate::models::{Payload, Task, TaskError};

/// 一次执行的结果
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Payload),
    Failed(TaskError),
    /// 请求重新提交，可附带中间结果
    Resubmit(Option<Payload>),
}

impl TaskOutcome {
    /// 将执行结果写入任务
    pub fn apply(self, task: &mut Task) {
        match self {
            TaskOutcome::Completed(result) => {
                task.result_received(result);
            }
            TaskOutcome::Failed(error) => {
                task.exception_received(error);
            }
            TaskOutcome::Resubmit(partial) => {
                task.request_resubmit(partial);
            }
        }
    }
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> TaskOutcome;

    fn name(&self) -> &str;
}

/// 闭包适配器
pub struct FnRunner<F> {
    name: String,
    func: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&Task) -> TaskOutcome + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> TaskRunner for FnRunner<F>
where
    F: Fn(&Task) -> TaskOutcome + Send + Sync,
{
    async fn run(&self, task: &Task) -> TaskOutcome {
        (self.func)(task)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
