use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use hermes_core::error::AppError;
use hermes_core::job::{Job, JobStatus};
use hermes_core::query::QuerySpec;
use hermes_core::traits::JobStore;

use crate::redis_err;

/// Job records as Redis hashes, one field per attribute, under `job:{id}`.
///
/// A per-user list under `user:{user}:jobs` serves history lookups and is
/// pruned lazily as records expire.
#[derive(Clone)]
pub struct RedisJobStore {
    manager: ConnectionManager,
    retention: Duration,
    status_guard: Script,
}

/// Rewrites the record only while the stored status still matches the one
/// the caller loaded, so two status writers can never clobber each other.
/// ARGV: expected status, field-pair count, field/value pairs, then the
/// optional fields to clear.
const STATUS_GUARD_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[1] then
    return 0
end
local i = 3
for _ = 1, tonumber(ARGV[2]) do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    i = i + 2
end
while i <= #ARGV do
    redis.call('HDEL', KEYS[1], ARGV[i])
    i = i + 1
end
return 1
"#;

/// Hash fields that are absent rather than empty when unset.
const OPTIONAL_FIELDS: &[&str] = &[
    "failed_reason",
    "timeout",
    "started_at",
    "ended_at",
    "waiting_elapsed_time",
    "running_elapsed_time",
    "total_elapsed_time",
];

fn job_key(id: Uuid) -> String {
    format!("job:{id}")
}

fn user_key(user: &str) -> String {
    format!("user:{user}:jobs")
}

impl RedisJobStore {
    pub fn new(manager: ConnectionManager, retention: Duration) -> Self {
        Self {
            manager,
            retention,
            status_guard: Script::new(STATUS_GUARD_SCRIPT),
        }
    }

    fn to_fields(job: &Job) -> Result<Vec<(&'static str, String)>, AppError> {
        let mut fields = vec![
            ("id", job.id.to_string()),
            ("user", job.user.clone()),
            ("host", job.host.clone()),
            ("query", serde_json::to_string(&job.query)?),
            ("status", job.status.as_str().to_string()),
            ("created_at", job.created_at.to_rfc3339()),
            ("updated_at", job.updated_at.to_rfc3339()),
        ];
        if let Some(reason) = &job.failed_reason {
            fields.push(("failed_reason", reason.clone()));
        }
        if let Some(timeout) = job.timeout {
            fields.push(("timeout", timeout.to_string()));
        }
        if let Some(at) = job.started_at {
            fields.push(("started_at", at.to_rfc3339()));
        }
        if let Some(at) = job.ended_at {
            fields.push(("ended_at", at.to_rfc3339()));
        }
        if let Some(t) = &job.waiting_elapsed_time {
            fields.push(("waiting_elapsed_time", t.clone()));
        }
        if let Some(t) = &job.running_elapsed_time {
            fields.push(("running_elapsed_time", t.clone()));
        }
        if let Some(t) = &job.total_elapsed_time {
            fields.push(("total_elapsed_time", t.clone()));
        }
        Ok(fields)
    }

    fn parse_job(id: Uuid, map: &HashMap<String, String>) -> Result<Job, AppError> {
        // A record missing mandatory fields is treated as absent, so a
        // half-expired or interrupted write never surfaces as data.
        let require = |key: &str| map.get(key).ok_or(AppError::NotFound(id));

        let parse_time = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| AppError::StoreError(format!("Corrupt timestamp '{raw}': {e}")))
        };

        let query: QuerySpec = serde_json::from_str(require("query")?)?;
        let status: JobStatus = require("status")?
            .parse()
            .map_err(|e| AppError::StoreError(format!("Corrupt status: {e}")))?;
        let timeout = map
            .get("timeout")
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| AppError::StoreError(format!("Corrupt timeout '{raw}'")))
            })
            .transpose()?;

        Ok(Job {
            id,
            user: require("user")?.clone(),
            host: require("host")?.clone(),
            query,
            status,
            failed_reason: map.get("failed_reason").cloned(),
            timeout,
            created_at: parse_time(require("created_at")?)?,
            updated_at: parse_time(require("updated_at")?)?,
            started_at: map.get("started_at").map(|r| parse_time(r)).transpose()?,
            ended_at: map.get("ended_at").map(|r| parse_time(r)).transpose()?,
            waiting_elapsed_time: map.get("waiting_elapsed_time").cloned(),
            running_elapsed_time: map.get("running_elapsed_time").cloned(),
            total_elapsed_time: map.get("total_elapsed_time").cloned(),
        })
    }

    /// Write the full record, clearing optional fields that went back to
    /// unset, in one transaction.
    async fn write(&self, job: &Job) -> Result<(), AppError> {
        let key = job_key(job.id);
        let fields = Self::to_fields(job)?;
        let absent: Vec<&str> = OPTIONAL_FIELDS
            .iter()
            .copied()
            .filter(|f| !fields.iter().any(|(name, _)| name == f))
            .collect();

        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(&key, &fields).ignore();
        if !absent.is_empty() {
            pipe.hdel(&key, absent).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(redis_err)
    }

    /// Like [`RedisJobStore::write`], but only while the stored status
    /// still matches the one the caller loaded. Returns `false` when a
    /// concurrent writer got there first.
    async fn write_if_status(&self, job: &Job, expected: JobStatus) -> Result<bool, AppError> {
        let fields = Self::to_fields(job)?;
        let absent: Vec<&str> = OPTIONAL_FIELDS
            .iter()
            .copied()
            .filter(|f| !fields.iter().any(|(name, _)| name == f))
            .collect();

        let mut invocation = self.status_guard.prepare_invoke();
        invocation.key(job_key(job.id));
        invocation.arg(expected.as_str()).arg(fields.len());
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }
        for name in absent {
            invocation.arg(name);
        }

        let mut conn = self.manager.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await.map_err(redis_err)?;
        Ok(applied == 1)
    }
}

impl JobStore for RedisJobStore {
    async fn create(&self, job: &Job) -> Result<(), AppError> {
        let fields = Self::to_fields(job)?;
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(job_key(job.id), &fields)
            .ignore()
            .lpush(user_key(&job.user), job.id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn get(&self, id: Uuid) -> Result<Job, AppError> {
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> =
            conn.hgetall(job_key(id)).await.map_err(redis_err)?;
        if map.is_empty() {
            return Err(AppError::NotFound(id));
        }
        Self::parse_job(id, &map)
    }

    async fn update(&self, job: &Job) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let exists: bool = conn.exists(job_key(job.id)).await.map_err(redis_err)?;
        if !exists {
            return Err(AppError::NotFound(job.id));
        }
        self.write(job).await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        reason: Option<&str>,
    ) -> Result<Job, AppError> {
        // Compare-and-write keyed on the loaded status: when another
        // writer (runner vs canceller) lands in between, the attempt is
        // rejected and the transition re-derives from the fresh record.
        for _ in 0..3 {
            let mut job = self.get(id).await?;
            let expected = job.status;
            job.set_status(status, reason)?;
            if !self.write_if_status(&job, expected).await? {
                continue;
            }

            let mut conn = self.manager.clone();
            if job.status.is_terminal() && job.status != JobStatus::Cancelled {
                let _: bool = conn
                    .expire(job_key(id), self.retention.as_secs() as i64)
                    .await
                    .map_err(redis_err)?;
            } else {
                // A cancelled record is kept for auditing; a requeued one
                // is live again.
                let _: bool = conn.persist(job_key(id)).await.map_err(redis_err)?;
            }
            return Ok(job);
        }
        Err(AppError::StoreError(format!(
            "Job {id} status kept changing concurrently"
        )))
    }

    async fn list(&self, user: &str) -> Result<Vec<Uuid>, AppError> {
        let key = user_key(user);
        let mut conn = self.manager.clone();
        let raw_ids: Vec<String> = conn.lrange(&key, 0, -1).await.map_err(redis_err)?;

        let mut ids = Vec::with_capacity(raw_ids.len());
        for raw in raw_ids {
            let Ok(id) = raw.parse::<Uuid>() else {
                let _: i64 = conn.lrem(&key, 0, &raw).await.map_err(redis_err)?;
                continue;
            };
            let exists: bool = conn.exists(job_key(id)).await.map_err(redis_err)?;
            if exists {
                ids.push(id);
            } else {
                // Record expired; drop the index entry as we go.
                let _: i64 = conn.lrem(&key, 0, &raw).await.map_err(redis_err)?;
            }
        }
        Ok(ids)
    }
}
