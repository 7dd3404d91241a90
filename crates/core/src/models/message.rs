use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::graph::TaskGraph;
use super::job::JobMetadata;
use super::sla::JobSla;
use super::task::{Task, TaskErrorKind};

/// 随任务束一起发送的作业头
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleHeader {
    pub job_uuid: Uuid,
    pub job_name: String,
    pub bundle_id: u64,
    pub sla: JobSla,
    pub metadata: JobMetadata,
    /// 作业的任务总数，而不是本任务束的任务数
    pub job_task_count: usize,
    pub task_graph: Option<TaskGraph>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMessage {
    pub header: BundleHeader,
    pub tasks: Vec<Task>,
}

impl BundleMessage {
    pub fn bundle_id(&self) -> u64 {
        self.header.bundle_id
    }
}

/// 接收端无法接收的任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedTask {
    pub position: usize,
    pub kind: TaskErrorKind,
    pub reason: String,
}

impl RejectedTask {
    pub fn new(position: usize, kind: TaskErrorKind, reason: impl Into<String>) -> Self {
        Self {
            position,
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendAck {
    pub rejected: Vec<RejectedTask>,
}

impl SendAck {
    pub fn accepted() -> Self {
        Self::default()
    }
}

/// 一批返回结果，按任务束id关联，可以只包含任务束的一部分
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub bundle_id: u64,
    pub tasks: Vec<Task>,
}
