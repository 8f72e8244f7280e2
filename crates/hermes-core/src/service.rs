use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::canceller::Canceller;
use crate::error::AppError;
use crate::job::{CreateJobRequest, Job, JobStatus};
use crate::query::QuerySpec;
use crate::runner::JobReporter;
use crate::traits::{JobQueue, JobStore, Publisher, SqlExecutor};

/// Submission-side operations: everything a caller does to a job from the
/// outside (create, inspect, rewrite, cancel, list).
pub struct JobService<S, Q, P, E>
where
    S: JobStore,
    Q: JobQueue,
    P: Publisher,
    E: SqlExecutor,
{
    store: S,
    queue: Q,
    publisher: P,
    canceller: Canceller<S, Q, E>,
}

impl<S, Q, P, E> JobService<S, Q, P, E>
where
    S: JobStore,
    Q: JobQueue,
    P: Publisher,
    E: SqlExecutor,
{
    pub fn new(store: S, queue: Q, publisher: P, executor: E) -> Self {
        let canceller = Canceller::new(store.clone(), queue.clone(), executor);
        Self {
            store,
            queue,
            publisher,
            canceller,
        }
    }

    /// Accept a job: validate the query shape, persist it as pending,
    /// enqueue it on its host queue and wake consumers up.
    ///
    /// The queue entry is durable before the wake-up is published; a lost
    /// notification only delays pickup until the next queue discovery.
    pub async fn create(&self, req: CreateJobRequest) -> Result<Job, AppError> {
        let job = Job::create(req)?;
        self.store.create(&job).await?;
        self.queue.enqueue(&job.host, job.id).await?;
        if let Err(e) = self.publisher.publish(&job.host).await {
            tracing::warn!(job_id = %job.id, host = %job.host, error = %e, "Wake-up publish failed, relying on queue discovery");
        }
        tracing::info!(job_id = %job.id, user = %job.user, host = %job.host, "Job accepted");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, AppError> {
        self.store.get(id).await
    }

    /// Rewrite the query of a job that has not started yet.
    pub async fn update(&self, id: Uuid, query: &Value) -> Result<Job, AppError> {
        let mut job = self.store.get(id).await?;
        if job.status != JobStatus::Pending {
            return Err(AppError::UpdateNotAllowed(job.status));
        }
        job.query = QuerySpec::parse(query)?;
        job.updated_at = Utc::now();
        self.store.update(&job).await?;
        tracing::info!(job_id = %id, "Job query updated");
        Ok(job)
    }

    /// Cancel a pending or running job on behalf of its owner.
    pub async fn cancel<R: JobReporter>(&self, id: Uuid, reporter: &R) -> Result<Job, AppError> {
        self.canceller.cancel(id, reporter).await
    }

    /// Interrupt a running job and requeue it at the front of its host
    /// queue. No-op for jobs that already resolved.
    pub async fn drain(&self, id: Uuid) -> Result<(), AppError> {
        self.canceller.drain(id).await
    }

    /// All jobs submitted by a user, newest first.
    pub async fn list(&self, user: &str) -> Result<Vec<Job>, AppError> {
        let ids = self.store.list(user).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get(id).await {
                Ok(job) => jobs.push(job),
                // Expired between the index read and the fetch.
                Err(AppError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// The subset of a user's jobs still waiting or executing.
    pub async fn list_work_in_progress(&self, user: &str) -> Result<Vec<Job>, AppError> {
        let jobs = self.list(user).await?;
        Ok(jobs.into_iter().filter(|j| !j.status.is_terminal()).collect())
    }
}
