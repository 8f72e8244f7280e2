use std::sync::Arc;
use std::time::Duration;

use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use uuid::Uuid;

use hermes_core::error::AppError;
use hermes_core::traits::{SqlExecutor, TenantConnection, TenantResolver};

/// SQLSTATE raised both by `statement_timeout` and by `pg_cancel_backend`.
const QUERY_CANCELED: &str = "57014";

/// Runs tenant statements over short-lived connections.
///
/// Each statement gets its own connection so the server-side timeout and
/// the job tag never leak into unrelated work. The tag (`/* job:<id> */`)
/// is what lets [`PgExecutor::cancel`] find the backend process later.
pub struct PgExecutor<R: TenantResolver> {
    resolver: Arc<R>,
}

impl<R: TenantResolver> Clone for PgExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
        }
    }
}

fn connect_options(tenant: &TenantConnection) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&tenant.host)
        .port(tenant.port)
        .database(&tenant.database)
        .username(&tenant.user)
        .password(&tenant.password)
}

fn statement_tag(job_id: Uuid) -> String {
    format!("/* job:{job_id} */")
}

/// Distinguish the two producers of SQLSTATE 57014: the server reports
/// "canceling statement due to statement timeout" for a timeout and "due
/// to user request" for `pg_cancel_backend`.
fn map_sql_error(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(QUERY_CANCELED) {
            if db.message().contains("statement timeout") {
                return AppError::StatementTimeout;
            }
            return AppError::QueryCancelled;
        }
        return AppError::DatabaseError(db.message().to_string());
    }
    AppError::DatabaseError(e.to_string())
}

impl<R: TenantResolver> PgExecutor<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    async fn connect(&self, host: &str) -> Result<PgConnection, AppError> {
        let tenant = self.resolver.resolve(host)?;
        PgConnection::connect_with(&connect_options(&tenant))
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect to '{host}': {e}")))
    }
}

impl<R: TenantResolver> SqlExecutor for PgExecutor<R> {
    async fn execute(
        &self,
        host: &str,
        job_id: Uuid,
        sql: &str,
        timeout: Duration,
    ) -> Result<(), AppError> {
        let mut conn = self.connect(host).await?;

        sqlx::query(&format!("SET statement_timeout = {}", timeout.as_millis()))
            .execute(&mut conn)
            .await
            .map_err(map_sql_error)?;

        let tagged = format!("{} {sql}", statement_tag(job_id));
        // `Executor::execute` on a plain `&str` runs the unprepared simple
        // protocol, same as `raw_sql`; `raw_sql`'s future hits a rustc
        // "implementation of `Executor` is not general enough" error here.
        let result = sqlx::Executor::execute(&mut conn, tagged.as_str()).await;

        if let Err(e) = conn.close().await {
            tracing::debug!(%host, error = %e, "Tenant connection did not close cleanly");
        }
        result.map(|_| ()).map_err(map_sql_error)
    }

    async fn cancel(&self, host: &str, job_id: Uuid) -> Result<bool, AppError> {
        let mut conn = self.connect(host).await?;

        let pattern = format!("{}%", statement_tag(job_id));
        let signalled: Vec<bool> = sqlx::query_scalar(
            "SELECT pg_cancel_backend(pid) FROM pg_stat_activity \
             WHERE state = 'active' AND query LIKE $1",
        )
        .bind(&pattern)
        .fetch_all(&mut conn)
        .await
        .map_err(map_sql_error)?;

        if let Err(e) = conn.close().await {
            tracing::debug!(%host, error = %e, "Tenant connection did not close cleanly");
        }
        Ok(signalled.into_iter().any(|hit| hit))
    }
}
