//! Interface boundaries of the batch core: durable job storage, per-host
//! queues, wake-up pub/sub, tenant SQL execution, and tenant metadata.
//!
//! Implementations live in `hermes-store` (Redis) and `hermes-db`
//! (PostgreSQL); handwritten mocks live in [`crate::testutil`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus};

/// Durable CRUD plus status-transition persistence for job records.
pub trait JobStore: Send + Sync + Clone {
    /// Persist a freshly created job as a single atomic write.
    fn create(&self, job: &Job) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Load a job. Fails with [`AppError::NotFound`] when the record is
    /// absent, expired, or only partially written.
    fn get(&self, id: Uuid) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Write back a full job record.
    fn update(&self, job: &Job) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Load, apply the status transition via [`Job::set_status`], and
    /// persist the result. Terminal records gain a retention TTL
    /// (cancelled records are kept without expiry).
    fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        reason: Option<&str>,
    ) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Historical job ids for a user, pruning ids whose record expired.
    fn list(&self, user: &str) -> impl Future<Output = Result<Vec<Uuid>, AppError>> + Send;
}

/// Per-host durable FIFO of pending job ids.
///
/// `enqueue` pushes to the head and `dequeue` pops from the tail;
/// `enqueue_first` pushes to the tail so a drained job is the next pickup.
pub trait JobQueue: Send + Sync + Clone {
    /// Atomically append a job id and index the host as active.
    fn enqueue(&self, host: &str, id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Atomically pop one id; de-indexes the host in the same step when
    /// the queue becomes empty. `None` means the queue is empty.
    fn dequeue(&self, host: &str)
    -> impl Future<Output = Result<Option<Uuid>, AppError>> + Send;

    /// Push a job id back to the front of the line (drain reinsertion).
    fn enqueue_first(
        &self,
        host: &str,
        id: Uuid,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Hosts currently indexed as having a non-empty queue.
    fn get_queues(&self) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Full key scan recovering hosts the index missed; re-indexes what it
    /// finds. Used at startup and periodically as a safety net.
    fn scan_queues(&self) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;
}

/// Fire-and-forget "host X has new work" notification.
pub trait Publisher: Send + Sync + Clone {
    fn publish(&self, host: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Source of host wake-ups for the orchestrator.
///
/// Implementations must run an initial queue-discovery pass before the live
/// subscription, re-run discovery periodically, and survive connection
/// drops by resubscribing.
pub trait Subscriber: Send + Sync {
    /// Start delivering host ids until the token is cancelled.
    fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<mpsc::Receiver<String>, AppError>> + Send;
}

/// SQL execution against a tenant database.
pub trait SqlExecutor: Send + Sync + Clone {
    /// Run one statement with a server-side statement timeout. The
    /// statement is tagged with the job id so a concurrent canceller can
    /// find its backend process.
    fn execute(
        &self,
        host: &str,
        job_id: Uuid,
        sql: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Signal the backend process running the tagged statement to stop.
    /// Returns true if a backend was found and signalled.
    fn cancel(&self, host: &str, job_id: Uuid)
    -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Connection parameters for one tenant database.
#[derive(Debug, Clone)]
pub struct TenantConnection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Resolves a tenant/host id to its database connection parameters.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<TenantConnection, AppError>;
}
