use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus};
use crate::traits::{JobQueue, JobStore, SqlExecutor};

/// Lifecycle events emitted by the consumer loop for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Running { job_id: Uuid, host: &'a str },
    Done { job_id: Uuid },
    Failed { job_id: Uuid, reason: &'a str },
    Cancelled { job_id: Uuid },
    Requeued { job_id: Uuid, host: &'a str },
    QueueEmpty { host: &'a str },
}

/// Trait for receiving job lifecycle events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Running { job_id, host } => {
                tracing::info!(%job_id, %host, "Job running");
            }
            JobEvent::Done { job_id } => {
                tracing::info!(%job_id, "Job done");
            }
            JobEvent::Failed { job_id, reason } => {
                tracing::warn!(%job_id, %reason, "Job failed");
            }
            JobEvent::Cancelled { job_id } => {
                tracing::info!(%job_id, "Job cancelled");
            }
            JobEvent::Requeued { job_id, host } => {
                tracing::debug!(%job_id, %host, "Job requeued for next statement");
            }
            JobEvent::QueueEmpty { host } => {
                tracing::debug!(%host, "Queue empty, consumer detaching");
            }
        }
    }
}

/// Configuration for a per-host consumer.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Global statement timeout ceiling. Per-job overrides never exceed it.
    pub default_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Shared slot exposing the job a consumer is currently executing, so a
/// drain can find and interrupt it.
#[derive(Clone, Default)]
pub struct CurrentJob(Arc<Mutex<Option<Uuid>>>);

impl CurrentJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Uuid> {
        *self.0.lock().unwrap()
    }

    fn set(&self, id: Uuid) {
        *self.0.lock().unwrap() = Some(id);
    }

    fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }
}

/// Per-host consumer: dequeues, executes, and requeues follow-up work.
///
/// One instance runs per active host; the orchestrator guarantees at most
/// one consumer per host queue, which is what preserves sequential job
/// ordering inside a tenant.
pub struct HostRunner<S, Q, E>
where
    S: JobStore,
    Q: JobQueue,
    E: SqlExecutor,
{
    store: S,
    queue: Q,
    executor: E,
    config: RunnerConfig,
}

impl<S, Q, E> HostRunner<S, Q, E>
where
    S: JobStore,
    Q: JobQueue,
    E: SqlExecutor,
{
    pub fn new(store: S, queue: Q, executor: E, config: RunnerConfig) -> Self {
        Self {
            store,
            queue,
            executor,
            config,
        }
    }

    /// Effective statement timeout: the smaller of the global default and
    /// the per-job override. A zero override means "not set".
    fn effective_timeout(&self, job: &Job) -> Duration {
        match job.timeout.filter(|&t| t > 0) {
            Some(secs) => self.config.default_timeout.min(Duration::from_secs(secs)),
            None => self.config.default_timeout,
        }
    }

    /// Consume the host queue until it is empty or the token is cancelled.
    ///
    /// Detaches (returns) on an empty dequeue; infrastructure errors also
    /// detach after logging, leaving re-adoption to the next wake-up.
    pub async fn run<R: JobReporter>(
        &self,
        host: &str,
        current: &CurrentJob,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(job_id) = self.queue.dequeue(host).await? else {
                reporter.report(JobEvent::QueueEmpty { host });
                break;
            };

            current.set(job_id);
            let result = self.process_one(host, job_id, reporter).await;
            current.clear();
            result?;
        }
        Ok(())
    }

    async fn process_one<R: JobReporter>(
        &self,
        host: &str,
        job_id: Uuid,
        reporter: &R,
    ) -> Result<(), AppError> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(AppError::NotFound(_)) => {
                tracing::warn!(%job_id, "Dequeued job no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Stale queue entries (cancelled while queued, expired, replayed).
        if !job.is_runnable() {
            tracing::warn!(%job_id, status = %job.status, "Skipping non-runnable queue entry");
            return Ok(());
        }

        let job = self
            .store
            .set_status(job_id, JobStatus::Running, None)
            .await?;
        reporter.report(JobEvent::Running { job_id, host });

        let Some(sql) = job.next_query() else {
            tracing::warn!(%job_id, "Runnable job has no next statement, closing");
            self.try_set(job_id, JobStatus::Done, None).await?;
            return Ok(());
        };

        let timeout = self.effective_timeout(&job);
        let updated = match self.executor.execute(host, job_id, sql, timeout).await {
            Ok(()) => self.try_set(job_id, JobStatus::Done, None).await?,
            Err(AppError::StatementTimeout) => {
                let reason = AppError::StatementTimeout.to_string();
                self.try_set(job_id, JobStatus::Failed, Some(&reason)).await?
            }
            Err(e) if e.is_cancel_signal() => {
                // The canceller owns the resulting status; never overwrite
                // a user-requested cancel with `failed`.
                tracing::debug!(%job_id, "Statement stopped by cancel signal");
                None
            }
            Err(AppError::DatabaseError(message)) => {
                self.try_set(job_id, JobStatus::Failed, Some(&message)).await?
            }
            Err(e) => return Err(e),
        };

        let Some(updated) = updated else {
            return Ok(());
        };

        match updated.status {
            JobStatus::Done => reporter.report(JobEvent::Done { job_id }),
            JobStatus::Failed => reporter.report(JobEvent::Failed {
                job_id,
                reason: updated.failed_reason.as_deref().unwrap_or_default(),
            }),
            // More statements remain: resume this job before any other
            // work on this host is served.
            JobStatus::Pending => {
                self.queue.enqueue_first(host, job_id).await?;
                reporter.report(JobEvent::Requeued { job_id, host });
            }
            _ => {}
        }

        Ok(())
    }

    /// Apply a transition, treating a transition conflict as "someone else
    /// already resolved this job" (e.g. the canceller won a race).
    async fn try_set(
        &self,
        job_id: Uuid,
        status: JobStatus,
        reason: Option<&str>,
    ) -> Result<Option<Job>, AppError> {
        match self.store.set_status(job_id, status, reason).await {
            Ok(job) => Ok(Some(job)),
            Err(AppError::InvalidTransition { from, to }) => {
                tracing::debug!(%job_id, %from, %to, "Status already resolved elsewhere");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
