use std::time::Duration;

use hermes_core::AppError;

/// Configuration for the Redis-backed job store and queues.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Retention of finished job records. Cancelled records are kept
    /// without expiry.
    pub retention: Duration,
    /// Pub/sub channel carrying host wake-ups.
    pub wake_channel: String,
    /// How often the subscriber re-scans for queues whose wake-up was lost.
    pub discovery_interval: Duration,
}

impl RedisConfig {
    /// Read configuration from environment variables.
    ///
    /// - `REDIS_URL` (required)
    /// - `JOB_RETENTION_HOURS` (optional, defaults to 48)
    /// - `WAKE_CHANNEL` (optional, defaults to `batch:hosts`)
    /// - `QUEUE_DISCOVERY_SECONDS` (optional, defaults to 300)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("REDIS_URL").map_err(|_| {
            AppError::ConfigError("REDIS_URL not set. Required for job storage.".into())
        })?;

        let retention_hours = parse_var("JOB_RETENTION_HOURS", 48)?;
        let discovery_seconds = parse_var("QUEUE_DISCOVERY_SECONDS", 300)?;
        let wake_channel =
            std::env::var("WAKE_CHANNEL").unwrap_or_else(|_| "batch:hosts".to_string());

        Ok(Self {
            url,
            retention: Duration::from_secs(retention_hours * 3600),
            wake_channel,
            discovery_interval: Duration::from_secs(discovery_seconds),
        })
    }
}

fn parse_var(name: &str, default: u64) -> Result<u64, AppError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let parsed: u64 = raw.parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid {name} '{raw}': must be a positive integer"))
            })?;
            if parsed == 0 {
                return Err(AppError::ConfigError(format!("{name} must be at least 1")));
            }
            Ok(parsed)
        }
    }
}
