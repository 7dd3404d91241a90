use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::graph::TaskGraph;
use super::sla::JobSla;
use super::task::{Payload, Task};

pub type JobMetadata = BTreeMap<String, String>;

/// 提交者构建的作业定义，交给作业管理器后不再由提交者持有
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub name: String,
    pub tasks: Vec<Task>,
    pub sla: JobSla,
    pub metadata: JobMetadata,
    pub task_graph: Option<TaskGraph>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            tasks: Vec::new(),
            sla: JobSla::default(),
            metadata: JobMetadata::new(),
            task_graph: None,
        }
    }

    /// 追加任务，位置按添加顺序分配
    pub fn add_task(mut self, payload: impl Into<Payload>) -> Self {
        let position = self.tasks.len();
        self.tasks.push(Task::new(position, payload));
        self
    }

    pub fn with_tasks<I, P>(mut self, payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Payload>,
    {
        for payload in payloads {
            let position = self.tasks.len();
            self.tasks.push(Task::new(position, payload));
        }
        self
    }

    pub fn with_sla(mut self, sla: JobSla) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_task_graph(mut self, graph: TaskGraph) -> Self {
        self.task_graph = Some(graph);
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// 作业的最终结果集
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResults {
    pub job_uuid: Uuid,
    pub job_name: String,
    pub cancelled: bool,
    pub expired: bool,
    /// 按位置排序的任务
    pub tasks: Vec<Task>,
    /// 广播作业：通道 uuid → 该通道上的任务结果
    pub broadcast: BTreeMap<String, Vec<Task>>,
}

impl JobResults {
    pub fn positions(&self) -> Vec<usize> {
        self.tasks.iter().map(Task::position).collect()
    }

    pub fn task(&self, position: usize) -> Option<&Task> {
        self.tasks
            .binary_search_by_key(&position, Task::position)
            .ok()
            .map(|index| &self.tasks[index])
    }
}
