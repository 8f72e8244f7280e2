use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::canceller::Canceller;
use crate::error::AppError;
use crate::runner::{CurrentJob, HostRunner, JobReporter, RunnerConfig};
use crate::traits::{JobQueue, JobStore, SqlExecutor, Subscriber};

/// A live per-host consumer entry.
struct HostHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    current: CurrentJob,
}

/// Orchestrator binding subscriber wake-ups to per-host consumer loops.
///
/// The pool map is the single at-most-one-consumer-per-host guard: a
/// wake-up for a host with a live entry is a no-op. Two processes racing
/// to adopt the same idle host is tolerated; the loser's dequeue comes up
/// empty and its consumer detaches.
pub struct Batch<S, Q, E, B, R>
where
    S: JobStore + 'static,
    Q: JobQueue + 'static,
    E: SqlExecutor + 'static,
    B: Subscriber,
    R: JobReporter + 'static,
{
    store: S,
    queue: Q,
    executor: E,
    subscriber: B,
    reporter: Arc<R>,
    config: RunnerConfig,
    pool: Arc<Mutex<HashMap<String, HostHandle>>>,
    cancel: CancellationToken,
}

impl<S, Q, E, B, R> Batch<S, Q, E, B, R>
where
    S: JobStore + 'static,
    Q: JobQueue + 'static,
    E: SqlExecutor + 'static,
    B: Subscriber,
    R: JobReporter + 'static,
{
    pub fn new(
        store: S,
        queue: Q,
        executor: E,
        subscriber: B,
        reporter: Arc<R>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            executor,
            subscriber,
            reporter,
            config,
            pool: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Process host wake-ups until [`Batch::drain`] stops this instance or
    /// the subscription channel closes.
    pub async fn run(&self) -> Result<(), AppError> {
        let mut hosts = self.subscriber.subscribe(self.cancel.child_token()).await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                host = hosts.recv() => {
                    let Some(host) = host else { break };
                    self.adopt(host);
                }
            }
        }
        Ok(())
    }

    /// Spawn a consumer for the host unless one is already attached.
    fn adopt(&self, host: String) {
        let mut pool = self.pool.lock().unwrap();
        if let Some(handle) = pool.get(&host) {
            if !handle.task.is_finished() {
                return;
            }
        }

        let cancel = self.cancel.child_token();
        let current = CurrentJob::new();
        let runner = HostRunner::new(
            self.store.clone(),
            self.queue.clone(),
            self.executor.clone(),
            self.config.clone(),
        );
        let reporter = Arc::clone(&self.reporter);
        let pool_ref = Arc::clone(&self.pool);
        let task_host = host.clone();
        let task_cancel = cancel.clone();
        let task_current = current.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = runner
                .run(&task_host, &task_current, &task_cancel, reporter.as_ref())
                .await
            {
                tracing::error!(host = %task_host, error = %e, "Consumer loop error, detaching");
            }
            pool_ref.lock().unwrap().remove(&task_host);
        });

        pool.insert(
            host,
            HostHandle {
                task,
                cancel,
                current,
            },
        );
    }

    /// Hosts with an attached consumer (monitoring/tests).
    pub fn active_hosts(&self) -> Vec<String> {
        self.pool.lock().unwrap().keys().cloned().collect()
    }

    /// Graceful shutdown: stop adopting work, interrupt every in-flight
    /// job so it is retried by the next consumer, and wait for all
    /// consumer tasks to finish.
    pub async fn drain(&self) -> Result<(), AppError> {
        self.cancel.cancel();

        let handles: Vec<(String, HostHandle)> = {
            let mut pool = self.pool.lock().unwrap();
            pool.drain().collect()
        };

        let canceller = Canceller::new(
            self.store.clone(),
            self.queue.clone(),
            self.executor.clone(),
        );

        let mut clean = true;
        for (host, handle) in handles {
            handle.cancel.cancel();
            if let Some(job_id) = handle.current.get() {
                if let Err(e) = canceller.drain(job_id).await {
                    tracing::error!(%host, %job_id, error = %e, "Drain failed for in-flight job");
                    clean = false;
                }
            }
            if handle.task.await.is_err() {
                tracing::error!(%host, "Consumer task panicked during drain");
                clean = false;
            }
        }

        if clean {
            Ok(())
        } else {
            Err(AppError::StoreError("drain did not complete cleanly".into()))
        }
    }

    /// Unsubscribe and drain.
    pub async fn stop(&self) -> Result<(), AppError> {
        self.drain().await
    }
}
