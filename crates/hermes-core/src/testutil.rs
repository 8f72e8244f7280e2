//! Handwritten in-memory mocks for the storage, queue, pub/sub and SQL
//! execution boundaries. Test-only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus};
use crate::runner::{JobEvent, JobReporter};
use crate::traits::{JobQueue, JobStore, Publisher, SqlExecutor, Subscriber};

/// In-memory [`JobStore`] over a shared map.
#[derive(Clone, Default)]
pub struct MockJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous status peek for polling assertions.
    pub fn status_of(&self, id: Uuid) -> Option<JobStatus> {
        self.jobs.lock().unwrap().get(&id).map(|j| j.status)
    }
}

impl JobStore for MockJobStore {
    async fn create(&self, job: &Job) -> Result<(), AppError> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Job, AppError> {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(AppError::NotFound(id))
    }

    async fn update(&self, job: &Job) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(AppError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        reason: Option<&str>,
    ) -> Result<Job, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(AppError::NotFound(id))?;
        job.set_status(status, reason)?;
        Ok(job.clone())
    }

    async fn list(&self, user: &str) -> Result<Vec<Uuid>, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.user == user)
            .map(|j| j.id)
            .collect())
    }
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<Uuid>>,
    index: HashSet<String>,
}

/// In-memory [`JobQueue`] with per-host FIFOs and a host index.
#[derive(Clone, Default)]
pub struct MockQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobQueue for MockQueue {
    async fn enqueue(&self, host: &str, id: Uuid) -> Result<(), AppError> {
        let mut state = self.inner.lock().unwrap();
        state.queues.entry(host.to_string()).or_default().push_back(id);
        state.index.insert(host.to_string());
        Ok(())
    }

    async fn dequeue(&self, host: &str) -> Result<Option<Uuid>, AppError> {
        let mut state = self.inner.lock().unwrap();
        let popped = state.queues.get_mut(host).and_then(|q| q.pop_front());
        if state.queues.get(host).is_none_or(|q| q.is_empty()) {
            state.queues.remove(host);
            state.index.remove(host);
        }
        Ok(popped)
    }

    async fn enqueue_first(&self, host: &str, id: Uuid) -> Result<(), AppError> {
        let mut state = self.inner.lock().unwrap();
        state
            .queues
            .entry(host.to_string())
            .or_default()
            .push_front(id);
        state.index.insert(host.to_string());
        Ok(())
    }

    async fn get_queues(&self) -> Result<Vec<String>, AppError> {
        let state = self.inner.lock().unwrap();
        let mut hosts: Vec<String> = state.index.iter().cloned().collect();
        hosts.sort();
        Ok(hosts)
    }

    async fn scan_queues(&self) -> Result<Vec<String>, AppError> {
        let mut state = self.inner.lock().unwrap();
        let mut hosts: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        for host in &hosts {
            state.index.insert(host.clone());
        }
        Ok(hosts)
    }
}

#[derive(Default)]
struct ExecState {
    results: VecDeque<Result<(), AppError>>,
    executed: Vec<(Uuid, String)>,
    cancel_calls: Vec<Uuid>,
    cancel_error: Option<AppError>,
    cancelled: HashSet<Uuid>,
    hang: bool,
}

/// Scriptable [`SqlExecutor`] recording every execute and cancel call.
#[derive(Clone, Default)]
pub struct MockExecutor {
    inner: Arc<Mutex<ExecState>>,
}

impl MockExecutor {
    /// Every statement succeeds immediately.
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Statements consume the scripted results in order; once exhausted,
    /// further statements succeed.
    pub fn with_results(results: Vec<Result<(), AppError>>) -> Self {
        let mock = Self::default();
        mock.inner.lock().unwrap().results = results.into();
        mock
    }

    /// The next `cancel` call fails with the given error.
    pub fn with_cancel_error(error: AppError) -> Self {
        let mock = Self::default();
        mock.inner.lock().unwrap().cancel_error = Some(error);
        mock
    }

    /// Statements block until cancelled, then fail like an interrupted
    /// backend would.
    pub fn hanging() -> Self {
        let mock = Self::default();
        mock.inner.lock().unwrap().hang = true;
        mock
    }

    pub fn executed(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .executed
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn execution_count(&self, job_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|(id, _)| *id == job_id)
            .count()
    }

    pub fn cancel_calls(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().cancel_calls.clone()
    }
}

impl SqlExecutor for MockExecutor {
    async fn execute(
        &self,
        _host: &str,
        job_id: Uuid,
        sql: &str,
        _timeout: Duration,
    ) -> Result<(), AppError> {
        let hang = {
            let mut state = self.inner.lock().unwrap();
            state.executed.push((job_id, sql.to_string()));
            state.hang
        };

        if hang {
            loop {
                if self.inner.lock().unwrap().cancelled.contains(&job_id) {
                    return Err(AppError::QueryCancelled);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        let mut state = self.inner.lock().unwrap();
        state.results.pop_front().unwrap_or(Ok(()))
    }

    async fn cancel(&self, _host: &str, job_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(e) = state.cancel_error.take() {
            return Err(e);
        }
        state.cancel_calls.push(job_id);
        state.cancelled.insert(job_id);
        Ok(true)
    }
}

/// Recording [`Publisher`], optionally failing every publish.
#[derive(Clone, Default)]
pub struct MockPublisher {
    published: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

impl Publisher for MockPublisher {
    async fn publish(&self, host: &str) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::StoreError("publish channel down".into()));
        }
        self.published.lock().unwrap().push(host.to_string());
        Ok(())
    }
}

/// [`Subscriber`] fed by a test-held channel sender.
pub struct MockSubscriber {
    receiver: Mutex<Option<mpsc::Receiver<String>>>,
}

impl MockSubscriber {
    pub fn new() -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                receiver: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl Subscriber for MockSubscriber {
    async fn subscribe(
        &self,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, AppError> {
        self.receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AppError::StoreError("subscription already taken".into()))
    }
}

/// Reporter collecting event labels for ordering assertions.
#[derive(Clone, Default)]
pub struct MockReporter {
    labels: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }
}

impl JobReporter for MockReporter {
    fn report(&self, event: JobEvent<'_>) {
        let label = match event {
            JobEvent::Running { .. } => "Running",
            JobEvent::Done { .. } => "Done",
            JobEvent::Failed { .. } => "Failed",
            JobEvent::Cancelled { .. } => "Cancelled",
            JobEvent::Requeued { .. } => "Requeued",
            JobEvent::QueueEmpty { .. } => "QueueEmpty",
        };
        self.labels.lock().unwrap().push(label.to_string());
    }
}
