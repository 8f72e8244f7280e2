//! Query-variant model: one job carries a single statement, an ordered
//! batch, or a fallback chain with onsuccess/onerror hooks.
//!
//! Variant dispatch is an explicit tagged union with pure transition
//! functions; the parse order (simple, then multiple, then fallback) is the
//! documented first-match rule for ambiguous payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::job::JobStatus;

/// One statement of a multi-statement job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryItem {
    pub query: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl QueryItem {
    fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            status: JobStatus::Pending,
            failed_reason: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// One statement of a fallback chain, with optional follow-up hooks.
///
/// `fallback_status` exists only when at least one hook is declared. It
/// starts pending and is driven to done/failed/skipped once the primary
/// status resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackItem {
    pub query: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onsuccess: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onerror: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl FallbackItem {
    fn new(query: impl Into<String>, onsuccess: Option<String>, onerror: Option<String>) -> Self {
        let has_hook = onsuccess.is_some() || onerror.is_some();
        Self {
            query: query.into(),
            status: JobStatus::Pending,
            onsuccess,
            onerror,
            fallback_status: has_hook.then_some(JobStatus::Pending),
            failed_reason: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// The hook matching the resolved primary status, if any.
    fn hook_for(&self, primary: JobStatus) -> Option<&str> {
        match primary {
            JobStatus::Done => self.onsuccess.as_deref(),
            JobStatus::Failed => self.onerror.as_deref(),
            _ => None,
        }
    }
}

/// A fallback chain, optionally with job-level hooks that fire once every
/// item has resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSpec {
    pub queries: Vec<FallbackItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onsuccess: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onerror: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_status: Option<JobStatus>,
}

/// The query payload of a job.
///
/// Serialized untagged: a simple job round-trips as a plain string, a
/// multiple job as an array of items, a fallback job as an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuerySpec {
    Simple(String),
    Multiple(Vec<QueryItem>),
    Fallback(FallbackSpec),
}

/// Position of the slot a status change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Primary(usize),
    Fallback(usize),
    JobFallback,
}

impl QuerySpec {
    pub fn is_simple(&self) -> bool {
        matches!(self, QuerySpec::Simple(_))
    }

    pub fn is_multiple(&self) -> bool {
        matches!(self, QuerySpec::Multiple(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, QuerySpec::Fallback(_))
    }

    /// True for a plain SQL string.
    fn matches_simple(value: &Value) -> bool {
        value.as_str().is_some_and(|s| !s.trim().is_empty())
    }

    /// True for a non-empty array of SQL strings.
    fn matches_multiple(value: &Value) -> bool {
        value
            .as_array()
            .is_some_and(|a| !a.is_empty() && a.iter().all(Value::is_string))
    }

    /// True for an array of `{query, onsuccess?, onerror?}` objects
    /// (strings permitted inline), or an object wrapping such an array
    /// under `queries` with optional job-level hooks.
    fn matches_fallback(value: &Value) -> bool {
        fn valid_entry(entry: &Value) -> bool {
            entry.is_string() || entry.get("query").is_some_and(Value::is_string)
        }
        match value {
            Value::Array(entries) => !entries.is_empty() && entries.iter().all(valid_entry),
            Value::Object(obj) => obj
                .get("queries")
                .and_then(Value::as_array)
                .is_some_and(|a| !a.is_empty() && a.iter().all(valid_entry)),
            _ => false,
        }
    }

    /// Parse a client payload, first variant match wins:
    /// simple, then multiple, then fallback.
    pub fn parse(value: &Value) -> Result<Self, AppError> {
        if Self::matches_simple(value) {
            let sql = value.as_str().unwrap_or_default();
            return Ok(QuerySpec::Simple(sql.to_string()));
        }
        if Self::matches_multiple(value) {
            let items = value
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_str).map(QueryItem::new).collect())
                .unwrap_or_default();
            return Ok(QuerySpec::Multiple(items));
        }
        if Self::matches_fallback(value) {
            return Ok(QuerySpec::Fallback(Self::parse_fallback(value)?));
        }
        Err(AppError::InvalidQuery(
            "query must be a SQL string, an array of statements, or a fallback chain".into(),
        ))
    }

    fn parse_fallback(value: &Value) -> Result<FallbackSpec, AppError> {
        let (entries, onsuccess, onerror) = match value {
            Value::Array(entries) => (entries.as_slice(), None, None),
            Value::Object(obj) => {
                let entries = obj
                    .get("queries")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                (
                    entries,
                    obj.get("onsuccess").and_then(Value::as_str).map(String::from),
                    obj.get("onerror").and_then(Value::as_str).map(String::from),
                )
            }
            _ => (Default::default(), None, None),
        };

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            let item = match entry {
                Value::String(sql) => FallbackItem::new(sql.clone(), None, None),
                Value::Object(obj) => {
                    let sql = obj
                        .get("query")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            AppError::InvalidQuery("fallback item is missing 'query'".into())
                        })?;
                    FallbackItem::new(
                        sql,
                        obj.get("onsuccess").and_then(Value::as_str).map(String::from),
                        obj.get("onerror").and_then(Value::as_str).map(String::from),
                    )
                }
                _ => {
                    return Err(AppError::InvalidQuery(
                        "fallback items must be strings or objects".into(),
                    ));
                }
            };
            items.push(item);
        }

        let has_hook = onsuccess.is_some() || onerror.is_some();
        Ok(FallbackSpec {
            queries: items,
            onsuccess,
            onerror,
            fallback_status: has_hook.then_some(JobStatus::Pending),
        })
    }

    /// The statement to execute now, or `None` when no runnable work
    /// remains. For a simple job the state lives on the job itself, so the
    /// job's status is passed in.
    ///
    /// Invariant: at most one slot is ever runnable at a time.
    pub fn next_query(&self, job_status: JobStatus) -> Option<&str> {
        match self {
            QuerySpec::Simple(sql) => {
                matches!(job_status, JobStatus::Pending | JobStatus::Running).then_some(sql.as_str())
            }
            QuerySpec::Multiple(items) => items
                .iter()
                .find(|i| matches!(i.status, JobStatus::Running | JobStatus::Pending))
                .map(|i| i.query.as_str()),
            QuerySpec::Fallback(spec) => spec.current_slot().map(|(_, sql)| sql),
        }
    }

    /// Cascade a validated status change into the current slot and derive
    /// the resulting overall job status.
    ///
    /// A requested terminal status is retargeted to `pending` whenever a
    /// runnable slot remains (follow-up statements, fallback hooks).
    pub fn apply_status(
        &mut self,
        requested: JobStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> JobStatus {
        match self {
            QuerySpec::Simple(_) => requested,
            QuerySpec::Multiple(items) => Self::apply_multiple(items, requested, reason, now),
            QuerySpec::Fallback(spec) => spec.apply(requested, reason, now),
        }
    }

    /// The failure reason of the first failed item, if any.
    pub fn failed_reason(&self) -> Option<&str> {
        match self {
            QuerySpec::Simple(_) => None,
            QuerySpec::Multiple(items) => items
                .iter()
                .find(|i| i.status == JobStatus::Failed)
                .and_then(|i| i.failed_reason.as_deref()),
            QuerySpec::Fallback(spec) => spec
                .queries
                .iter()
                .find(|i| i.status == JobStatus::Failed)
                .and_then(|i| i.failed_reason.as_deref()),
        }
    }

    fn apply_multiple(
        items: &mut [QueryItem],
        requested: JobStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> JobStatus {
        let running = items.iter().position(|i| i.status == JobStatus::Running);
        let pending = items.iter().position(|i| i.status == JobStatus::Pending);

        match requested {
            JobStatus::Running => {
                if let Some(idx) = pending {
                    items[idx].status = JobStatus::Running;
                    items[idx].started_at = Some(now);
                }
            }
            JobStatus::Done => {
                if let Some(idx) = running {
                    items[idx].status = JobStatus::Done;
                    items[idx].ended_at = Some(now);
                }
            }
            JobStatus::Failed => {
                if let Some(idx) = running {
                    items[idx].status = JobStatus::Failed;
                    items[idx].failed_reason = reason.map(str::to_string);
                    items[idx].ended_at = Some(now);
                    // Failure halts the batch: everything after is skipped.
                    for item in items[idx + 1..].iter_mut() {
                        if item.status == JobStatus::Pending {
                            item.status = JobStatus::Skipped;
                        }
                    }
                }
            }
            JobStatus::Cancelled => {
                if let Some(idx) = running.or(pending) {
                    items[idx].status = JobStatus::Cancelled;
                    items[idx].ended_at = Some(now);
                }
                for item in items.iter_mut() {
                    if item.status == JobStatus::Pending {
                        item.status = JobStatus::Skipped;
                    }
                }
            }
            JobStatus::Pending => {
                // Drain: the interrupted statement goes back to pending.
                if let Some(idx) = running {
                    items[idx].status = JobStatus::Pending;
                    items[idx].started_at = None;
                }
            }
            JobStatus::Unknown => {
                if let Some(idx) = running.or(pending) {
                    items[idx].status = JobStatus::Unknown;
                }
            }
            JobStatus::Skipped => {
                for item in items.iter_mut() {
                    if item.status == JobStatus::Pending {
                        item.status = JobStatus::Skipped;
                    }
                }
            }
        }

        Self::derive_multiple(items, requested)
    }

    fn derive_multiple(items: &[QueryItem], requested: JobStatus) -> JobStatus {
        if items.iter().any(|i| i.status == JobStatus::Running) {
            return JobStatus::Running;
        }
        if requested == JobStatus::Unknown || items.iter().any(|i| i.status == JobStatus::Unknown) {
            return JobStatus::Unknown;
        }
        if items.iter().any(|i| i.status == JobStatus::Pending) {
            return JobStatus::Pending;
        }
        if items.iter().any(|i| i.status == JobStatus::Cancelled) {
            return JobStatus::Cancelled;
        }
        if items.iter().any(|i| i.status == JobStatus::Failed) {
            return JobStatus::Failed;
        }
        if items.iter().all(|i| i.status == JobStatus::Skipped) {
            return JobStatus::Skipped;
        }
        JobStatus::Done
    }
}

impl FallbackSpec {
    /// The slot to execute now, scanning chain order: each item's primary,
    /// then its resolved fallback hook, then the job-level hook once every
    /// item has settled.
    fn current_slot(&self) -> Option<(Slot, &str)> {
        for (idx, item) in self.queries.iter().enumerate() {
            match item.status {
                JobStatus::Running | JobStatus::Pending => {
                    return Some((Slot::Primary(idx), item.query.as_str()));
                }
                JobStatus::Done | JobStatus::Failed => {
                    if matches!(
                        item.fallback_status,
                        Some(JobStatus::Pending) | Some(JobStatus::Running)
                    ) {
                        if let Some(sql) = item.hook_for(item.status) {
                            return Some((Slot::Fallback(idx), sql));
                        }
                    }
                }
                _ => {}
            }
        }

        if matches!(
            self.fallback_status,
            Some(JobStatus::Pending) | Some(JobStatus::Running)
        ) {
            if let Some(sql) = self.job_hook() {
                return Some((Slot::JobFallback, sql));
            }
        }
        None
    }

    /// The job-level hook matching the chain outcome so far.
    fn job_hook(&self) -> Option<&str> {
        if self.queries.iter().any(|i| i.status == JobStatus::Failed) {
            self.onerror.as_deref()
        } else if self.queries.iter().all(|i| i.status == JobStatus::Done) {
            self.onsuccess.as_deref()
        } else {
            None
        }
    }

    fn apply(
        &mut self,
        requested: JobStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> JobStatus {
        let slot = self.current_slot().map(|(slot, _)| slot);

        match requested {
            JobStatus::Running => match slot {
                Some(Slot::Primary(idx)) => {
                    self.queries[idx].status = JobStatus::Running;
                    self.queries[idx].started_at = Some(now);
                }
                Some(Slot::Fallback(idx)) => {
                    self.queries[idx].fallback_status = Some(JobStatus::Running);
                }
                Some(Slot::JobFallback) => {
                    self.fallback_status = Some(JobStatus::Running);
                }
                None => {}
            },
            JobStatus::Done | JobStatus::Failed => match slot {
                Some(Slot::Primary(idx)) => {
                    self.queries[idx].status = requested;
                    self.queries[idx].ended_at = Some(now);
                    if requested == JobStatus::Failed {
                        self.queries[idx].failed_reason = reason.map(str::to_string);
                        // Failure halts the chain; only this item's onerror
                        // and the job-level onerror remain runnable.
                        for item in self.queries[idx + 1..].iter_mut() {
                            if item.status == JobStatus::Pending {
                                item.status = JobStatus::Skipped;
                            }
                            if item.fallback_status == Some(JobStatus::Pending) {
                                item.fallback_status = Some(JobStatus::Skipped);
                            }
                        }
                    }
                }
                Some(Slot::Fallback(idx)) => {
                    self.queries[idx].fallback_status = Some(requested);
                }
                Some(Slot::JobFallback) => {
                    self.fallback_status = Some(requested);
                }
                None => {}
            },
            JobStatus::Cancelled => {
                match slot {
                    Some(Slot::Primary(idx)) => {
                        self.queries[idx].status = JobStatus::Cancelled;
                        self.queries[idx].ended_at = Some(now);
                    }
                    Some(Slot::Fallback(idx)) => {
                        self.queries[idx].fallback_status = Some(JobStatus::Cancelled);
                    }
                    Some(Slot::JobFallback) => {
                        self.fallback_status = Some(JobStatus::Cancelled);
                    }
                    None => {}
                }
                self.skip_pending();
            }
            JobStatus::Pending => match slot {
                Some(Slot::Primary(idx)) if self.queries[idx].status == JobStatus::Running => {
                    self.queries[idx].status = JobStatus::Pending;
                    self.queries[idx].started_at = None;
                }
                Some(Slot::Fallback(idx)) => {
                    self.queries[idx].fallback_status = Some(JobStatus::Pending);
                }
                Some(Slot::JobFallback) => {
                    self.fallback_status = Some(JobStatus::Pending);
                }
                _ => {}
            },
            JobStatus::Unknown => match slot {
                Some(Slot::Primary(idx)) => self.queries[idx].status = JobStatus::Unknown,
                Some(Slot::Fallback(idx)) => {
                    self.queries[idx].fallback_status = Some(JobStatus::Unknown);
                }
                Some(Slot::JobFallback) => self.fallback_status = Some(JobStatus::Unknown),
                None => {}
            },
            JobStatus::Skipped => self.skip_pending(),
        }

        self.settle();
        self.derive(requested)
    }

    fn skip_pending(&mut self) {
        for item in self.queries.iter_mut() {
            if item.status == JobStatus::Pending {
                item.status = JobStatus::Skipped;
            }
            if item.fallback_status == Some(JobStatus::Pending) {
                item.fallback_status = Some(JobStatus::Skipped);
            }
        }
        if self.fallback_status == Some(JobStatus::Pending) {
            self.fallback_status = Some(JobStatus::Skipped);
        }
    }

    /// Resolve fallback statuses that can no longer fire: a pending
    /// fallback whose primary resolved without a matching hook is skipped,
    /// never left pending forever. Idempotent.
    fn settle(&mut self) {
        for item in self.queries.iter_mut() {
            if item.fallback_status == Some(JobStatus::Pending)
                && item.status.is_terminal()
                && item.hook_for(item.status).is_none()
            {
                item.fallback_status = Some(JobStatus::Skipped);
            }
        }

        let items_settled = self.queries.iter().all(|i| {
            i.status.is_terminal()
                && !matches!(
                    i.fallback_status,
                    Some(JobStatus::Pending) | Some(JobStatus::Running)
                )
        });
        if items_settled
            && self.fallback_status == Some(JobStatus::Pending)
            && self.job_hook().is_none()
        {
            self.fallback_status = Some(JobStatus::Skipped);
        }
    }

    fn derive(&self, requested: JobStatus) -> JobStatus {
        let running = self.queries.iter().any(|i| {
            i.status == JobStatus::Running || i.fallback_status == Some(JobStatus::Running)
        }) || self.fallback_status == Some(JobStatus::Running);
        if running {
            return JobStatus::Running;
        }
        if requested == JobStatus::Unknown
            || self.queries.iter().any(|i| i.status == JobStatus::Unknown)
        {
            return JobStatus::Unknown;
        }
        if self.current_slot().is_some() {
            return JobStatus::Pending;
        }
        let cancelled = self.queries.iter().any(|i| {
            i.status == JobStatus::Cancelled || i.fallback_status == Some(JobStatus::Cancelled)
        }) || self.fallback_status == Some(JobStatus::Cancelled);
        if cancelled {
            return JobStatus::Cancelled;
        }
        if self.queries.iter().any(|i| i.status == JobStatus::Failed) {
            return JobStatus::Failed;
        }
        if self.queries.iter().all(|i| i.status == JobStatus::Skipped) {
            return JobStatus::Skipped;
        }
        JobStatus::Done
    }
}
