pub mod bundle;
pub mod client_job;
pub mod handle;

pub use bundle::ClientTaskBundle;
pub use client_job::ClientJob;
pub use handle::JobHandle;
