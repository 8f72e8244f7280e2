pub mod config;
pub mod job_store;
pub mod pubsub;
pub mod queue;

pub use config::RedisConfig;
pub use job_store::RedisJobStore;
pub use pubsub::{RedisPublisher, RedisSubscriber};
pub use queue::RedisJobQueue;

use hermes_core::error::AppError;
use redis::aio::ConnectionManager;

pub(crate) fn redis_err(e: redis::RedisError) -> AppError {
    AppError::StoreError(e.to_string())
}

/// Open a Redis client plus a multiplexed connection manager.
pub async fn connect(config: &RedisConfig) -> Result<(redis::Client, ConnectionManager), AppError> {
    let client = redis::Client::open(config.url.as_str()).map_err(redis_err)?;
    let manager = client.get_connection_manager().await.map_err(redis_err)?;
    Ok((client, manager))
}
