use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use grid_core::models::{BundleHeader, Task};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::ServerJob;

static NEXT_DISPATCH_ID: AtomicU64 = AtomicU64::new(1);

/// 驱动端发给单个节点的一次分发
pub struct ServerTaskBundleNode {
    id: u64,
    job: Weak<ServerJob>,
    job_uuid: Uuid,
    node_uuid: String,
    header: BundleHeader,
    tasks: Vec<Task>,
    cancel: CancellationToken,
    created: Instant,
}

impl ServerTaskBundleNode {
    pub(crate) fn new(job: &Arc<ServerJob>, node_uuid: &str, tasks: Vec<Task>) -> Self {
        Self {
            id: NEXT_DISPATCH_ID.fetch_add(1, Ordering::Relaxed),
            job: Arc::downgrade(job),
            job_uuid: job.uuid(),
            node_uuid: node_uuid.to_string(),
            header: job.header().clone(),
            tasks,
            cancel: CancellationToken::new(),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job(&self) -> Option<Arc<ServerJob>> {
        self.job.upgrade()
    }

    pub fn job_uuid(&self) -> Uuid {
        self.job_uuid
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    pub fn header(&self) -> &BundleHeader {
        &self.header
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn positions(&self) -> Vec<usize> {
        self.tasks.iter().map(Task::position).collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }
}

impl std::fmt::Debug for ServerTaskBundleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTaskBundleNode")
            .field("id", &self.id)
            .field("job", &self.header.job_name)
            .field("node", &self.node_uuid)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
