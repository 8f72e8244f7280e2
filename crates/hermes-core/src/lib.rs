pub mod batch;
pub mod canceller;
pub mod error;
pub mod job;
pub mod query;
pub mod runner;
pub mod service;
pub mod traits;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use batch::Batch;
pub use canceller::Canceller;
pub use error::AppError;
pub use job::{CreateJobRequest, Job, JobStatus};
pub use query::QuerySpec;
pub use runner::{
    CurrentJob, HostRunner, JobEvent, JobReporter, RunnerConfig, TracingJobReporter,
};
pub use service::JobService;
pub use traits::{
    JobQueue, JobStore, Publisher, SqlExecutor, Subscriber, TenantConnection, TenantResolver,
};
