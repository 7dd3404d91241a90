pub mod channel;
pub mod graph;
pub mod job;
pub mod management;
pub mod message;
pub mod policy;
pub mod sla;
pub mod status;
pub mod task;

pub use channel::{ConnectionStatus, ExecutorStatus};
pub use graph::TaskGraph;
pub use job::{Job, JobMetadata, JobResults};
pub use management::{ManagementInfo, SystemInformation};
pub use message::{BundleHeader, BundleMessage, RejectedTask, ResultMessage, SendAck};
pub use policy::ExecutionPolicy;
pub use sla::{JobSla, ResultsStrategy};
pub use status::{AtomicStatus, JobStatus, StatusOrdinal, SubmissionStatus};
pub use task::{Payload, ResubmitExhaustedPolicy, Task, TaskError, TaskErrorKind, TaskState};
