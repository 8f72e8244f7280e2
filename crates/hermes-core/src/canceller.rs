use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus};
use crate::runner::{JobEvent, JobReporter};
use crate::traits::{JobQueue, JobStore, SqlExecutor};

/// Cancels in-flight database work and supports graceful drain.
///
/// Statements are dispatched with a job-id comment tag precisely so this
/// component can locate and signal the backend process running them.
pub struct Canceller<S, Q, E>
where
    S: JobStore,
    Q: JobQueue,
    E: SqlExecutor,
{
    store: S,
    queue: Q,
    executor: E,
}

impl<S, Q, E> Canceller<S, Q, E>
where
    S: JobStore,
    Q: JobQueue,
    E: SqlExecutor,
{
    pub fn new(store: S, queue: Q, executor: E) -> Self {
        Self {
            store,
            queue,
            executor,
        }
    }

    /// Cancel a job.
    ///
    /// A pending job is transitioned directly (nothing is running). A
    /// running job first gets its backend statement signalled, then the
    /// record (and the in-flight item) is transitioned. A repeated cancel
    /// surfaces the state machine's transition error; any other status
    /// fails with [`AppError::CancelNotAllowed`].
    pub async fn cancel<R: JobReporter>(
        &self,
        job_id: Uuid,
        reporter: &R,
    ) -> Result<Job, AppError> {
        let job = self.store.get(job_id).await?;

        let updated = match job.status {
            JobStatus::Pending => {
                self.store
                    .set_status(job_id, JobStatus::Cancelled, None)
                    .await?
            }
            JobStatus::Running => {
                let signalled = self.executor.cancel(&job.host, job_id).await?;
                if !signalled {
                    // Statement may have just finished; the transition below
                    // will fail if the runner already resolved the job.
                    tracing::warn!(%job_id, host = %job.host, "No running backend found for job");
                }
                self.store
                    .set_status(job_id, JobStatus::Cancelled, None)
                    .await?
            }
            JobStatus::Cancelled => {
                // Let the transition table report the repeat attempt.
                self.store
                    .set_status(job_id, JobStatus::Cancelled, None)
                    .await?
            }
            status => return Err(AppError::CancelNotAllowed(status)),
        };

        reporter.report(JobEvent::Cancelled { job_id });
        Ok(updated)
    }

    /// Graceful-shutdown variant: interrupt the running statement, reopen
    /// the job as pending, and put it at the front of its queue so the
    /// next consumer resumes it.
    ///
    /// A job that already resolved is a no-op. A cancel failure escalates
    /// the job to `unknown` rather than silently dropping it; drain itself
    /// never fails the shutdown.
    pub async fn drain(&self, job_id: Uuid) -> Result<(), AppError> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(AppError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if job.status != JobStatus::Running {
            // Pending jobs are still queued; terminal jobs already resolved.
            return Ok(());
        }

        if let Err(e) = self.executor.cancel(&job.host, job_id).await {
            tracing::warn!(%job_id, error = %e, "Drain could not cancel statement, marking unknown");
            let _ = self
                .store
                .set_status(job_id, JobStatus::Unknown, None)
                .await;
            return Ok(());
        }

        match self
            .store
            .set_status(job_id, JobStatus::Pending, None)
            .await
        {
            Ok(_) => {
                self.queue.enqueue_first(&job.host, job_id).await?;
                tracing::info!(%job_id, host = %job.host, "Job drained and requeued");
            }
            Err(AppError::InvalidTransition { from, to }) => {
                // The statement resolved before the cancel landed.
                tracing::debug!(%job_id, %from, %to, "Job resolved before drain");
            }
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Drain could not reopen job, marking unknown");
                let _ = self
                    .store
                    .set_status(job_id, JobStatus::Unknown, None)
                    .await;
            }
        }

        Ok(())
    }
}
