use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    Started,
    Dispatched,
    Returned,
    Ended,
}

/// 作业生命周期事件；分发与返回事件携带任务位置与通道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_uuid: Uuid,
    pub job_name: String,
    pub positions: Vec<usize>,
    pub channel_uuid: Option<String>,
}

impl JobEvent {
    pub fn started(job_uuid: Uuid, job_name: &str) -> Self {
        Self::new(JobEventKind::Started, job_uuid, job_name, Vec::new(), None)
    }

    pub fn dispatched(job_uuid: Uuid, job_name: &str, positions: Vec<usize>, channel: &str) -> Self {
        Self::new(
            JobEventKind::Dispatched,
            job_uuid,
            job_name,
            positions,
            Some(channel.to_string()),
        )
    }

    pub fn returned(job_uuid: Uuid, job_name: &str, positions: Vec<usize>, channel: &str) -> Self {
        Self::new(
            JobEventKind::Returned,
            job_uuid,
            job_name,
            positions,
            Some(channel.to_string()),
        )
    }

    pub fn ended(job_uuid: Uuid, job_name: &str) -> Self {
        Self::new(JobEventKind::Ended, job_uuid, job_name, Vec::new(), None)
    }

    fn new(
        kind: JobEventKind,
        job_uuid: Uuid,
        job_name: &str,
        positions: Vec<usize>,
        channel_uuid: Option<String>,
    ) -> Self {
        Self {
            kind,
            job_uuid,
            job_name: job_name.to_string(),
            positions,
            channel_uuid,
        }
    }
}

/// 作业事件监听器，回调中不得阻塞
pub trait JobListener: Send + Sync {
    fn job_started(&self, _event: &JobEvent) {}
    fn job_dispatched(&self, _event: &JobEvent) {}
    fn job_returned(&self, _event: &JobEvent) {}
    fn job_ended(&self, _event: &JobEvent) {}
}

/// 事件分发器，向所有已注册的监听器广播
#[derive(Default)]
pub struct JobNotifier {
    listeners: RwLock<Vec<Arc<dyn JobListener>>>,
}

impl JobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn JobListener>) {
        sync::write(&self.listeners).push(listener);
    }

    pub fn listener_count(&self) -> usize {
        sync::read(&self.listeners).len()
    }

    pub fn fire(&self, event: JobEvent) {
        // 快照后再回调，不持锁调用外部代码
        let listeners: Vec<_> = sync::read(&self.listeners).clone();
        for listener in listeners {
            match event.kind {
                JobEventKind::Started => listener.job_started(&event),
                JobEventKind::Dispatched => listener.job_dispatched(&event),
                JobEventKind::Returned => listener.job_returned(&event),
                JobEventKind::Ended => listener.job_ended(&event),
            }
        }
    }
}
