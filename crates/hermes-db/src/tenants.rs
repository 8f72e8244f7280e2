use std::collections::HashMap;

use serde::Deserialize;

use hermes_core::error::AppError;
use hermes_core::traits::{TenantConnection, TenantResolver};

#[derive(Debug, Deserialize)]
struct TenantEntry {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    database: String,
    user: String,
    password: String,
}

fn default_port() -> u16 {
    5432
}

/// Fixed host-to-database map loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantResolver {
    tenants: HashMap<String, TenantConnection>,
}

impl StaticTenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, host: impl Into<String>, conn: TenantConnection) -> Self {
        self.tenants.insert(host.into(), conn);
        self
    }

    /// Read the tenant map from the `TENANT_DATABASES` environment
    /// variable, a JSON object keyed by host id:
    ///
    /// ```json
    /// {"db-01": {"host": "10.0.0.5", "database": "app", "user": "batch", "password": "..."}}
    /// ```
    pub fn from_env() -> Result<Self, AppError> {
        let raw = std::env::var("TENANT_DATABASES").map_err(|_| {
            AppError::ConfigError("TENANT_DATABASES not set. Required for SQL execution.".into())
        })?;

        let entries: HashMap<String, TenantEntry> = serde_json::from_str(&raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid TENANT_DATABASES: {e}")))?;

        let tenants = entries
            .into_iter()
            .map(|(id, e)| {
                (
                    id,
                    TenantConnection {
                        host: e.host,
                        port: e.port,
                        database: e.database,
                        user: e.user,
                        password: e.password,
                    },
                )
            })
            .collect();

        Ok(Self { tenants })
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.tenants.keys().map(String::as_str).collect()
    }
}

impl TenantResolver for StaticTenantResolver {
    fn resolve(&self, host: &str) -> Result<TenantConnection, AppError> {
        self.tenants
            .get(host)
            .cloned()
            .ok_or_else(|| AppError::ConfigError(format!("Unknown host '{host}'")))
    }
}
