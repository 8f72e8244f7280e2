use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::query::QuerySpec;
use crate::util::format_elapsed;

/// Status of a job (or of a single query item within one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
    Unknown,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Unknown => "unknown",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::Unknown
                | JobStatus::Skipped
        )
    }

    /// The allowed status transition table.
    ///
    /// `running -> pending` exists solely for drain re-enqueue; every
    /// terminal status is a dead end.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Unknown)
                | (Pending, Skipped)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Running, Unknown)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "unknown" => Ok(JobStatus::Unknown),
            "skipped" => Ok(JobStatus::Skipped),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A client-submitted SQL job.
///
/// `host` selects the queue shard and backing database; it is internal
/// and never serialized back to clients.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub user: String,
    #[serde(skip_serializing)]
    pub host: String,
    pub query: QuerySpec,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_elapsed_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_elapsed_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_elapsed_time: Option<String>,
}

/// Request to create a new job.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub user: String,
    pub host: String,
    /// Raw query payload; validated against the three variant shapes.
    pub query: Value,
    /// Per-job statement timeout in seconds. `0` means "not set".
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl CreateJobRequest {
    pub fn new(user: impl Into<String>, host: impl Into<String>, query: Value) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            query,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }
}

impl Job {
    /// Validate the query payload and build a pending job.
    ///
    /// Fails with [`AppError::InvalidQuery`] if the payload matches none of
    /// the supported shapes.
    pub fn create(request: CreateJobRequest) -> Result<Self, AppError> {
        let query = QuerySpec::parse(&request.query)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user: request.user,
            host: request.host,
            query,
            status: JobStatus::Pending,
            failed_reason: None,
            // A zero timeout is treated as "not set", not "unbounded".
            timeout: request.timeout.filter(|&t| t > 0),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            waiting_elapsed_time: None,
            running_elapsed_time: None,
            total_elapsed_time: None,
        })
    }

    /// The statement to execute now: the running slot if any, otherwise
    /// the first runnable pending slot. `None` means no work remains.
    pub fn next_query(&self) -> Option<&str> {
        self.query.next_query(self.status)
    }

    pub fn has_next_query(&self) -> bool {
        self.next_query().is_some()
    }

    /// A job is only picked up by a consumer while pending.
    pub fn is_runnable(&self) -> bool {
        self.status == JobStatus::Pending
    }

    /// Apply a status transition, cascading into the current query slot.
    ///
    /// The requested status is validated against the transition table of the
    /// job's current status. A requested `done` (or `failed`, for fallback
    /// chains) is silently retargeted to `pending` while runnable work
    /// remains, which is what keeps multi-statement jobs alive across runner
    /// iterations.
    pub fn set_status(
        &mut self,
        requested: JobStatus,
        reason: Option<&str>,
    ) -> Result<(), AppError> {
        if !self.status.can_transition_to(requested) {
            return Err(AppError::InvalidTransition {
                from: self.status,
                to: requested,
            });
        }

        let now = Utc::now();
        let derived = self.query.apply_status(requested, reason, now);

        if requested == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if derived.is_terminal() {
            self.ended_at = Some(now);
            self.compute_elapsed(now);
        }
        if derived == JobStatus::Failed {
            self.failed_reason = reason
                .map(str::to_string)
                .or_else(|| self.query.failed_reason().map(str::to_string));
        }

        self.status = derived;
        self.updated_at = now;
        Ok(())
    }

    /// Client-facing JSON. Drops `host` via the `Serialize` impl.
    pub fn serialize(&self) -> Result<Value, AppError> {
        Ok(serde_json::to_value(self)?)
    }

    fn compute_elapsed(&mut self, ended: DateTime<Utc>) {
        if let Some(started) = self.started_at {
            self.waiting_elapsed_time = Some(format_elapsed(started - self.created_at));
            self.running_elapsed_time = Some(format_elapsed(ended - started));
        }
        self.total_elapsed_time = Some(format_elapsed(ended - self.created_at));
    }
}
