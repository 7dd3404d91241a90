use std::sync::Arc;
use std::time::Duration;

use grid_core::errors::{GridError, GridResult};
use grid_core::models::{JobResults, JobStatus, SubmissionStatus};
use uuid::Uuid;

use super::client_job::ClientJob;

/// 提交者持有的作业句柄
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<ClientJob>,
}

impl JobHandle {
    pub(crate) fn new(job: Arc<ClientJob>) -> Self {
        Self { job }
    }

    pub fn uuid(&self) -> Uuid {
        self.job.uuid()
    }

    pub fn job(&self) -> &Arc<ClientJob> {
        &self.job
    }

    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    pub fn submission_status(&self) -> SubmissionStatus {
        self.job.submission_status()
    }

    pub fn cancel(&self) -> bool {
        self.job.cancel(true)
    }

    pub fn try_results(&self) -> Option<Arc<JobResults>> {
        self.job.results()
    }

    /// 等待作业结束
    pub async fn await_results(&self) -> GridResult<Arc<JobResults>> {
        let mut rx = self.job.subscribe();
        let results = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| GridError::Internal(format!("作业 {} 的结果通道已关闭", self.job.uuid())))?;
        results
            .clone()
            .ok_or_else(|| GridError::Internal("作业结果为空".to_string()))
    }

    /// 超时返回 `None`
    pub async fn await_results_timeout(&self, timeout: Duration) -> GridResult<Option<Arc<JobResults>>> {
        match tokio::time::timeout(timeout, self.await_results()).await {
            Ok(results) => results.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("JobHandle").field(&self.job).finish()
    }
}
