use std::time::Duration;

use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use hermes_core::error::AppError;
use hermes_core::traits::{JobQueue, Publisher, Subscriber};

use crate::queue::RedisJobQueue;
use crate::redis_err;

/// Publishes "host X has new work" wake-ups on a single channel.
#[derive(Clone)]
pub struct RedisPublisher {
    manager: ConnectionManager,
    channel: String,
}

impl RedisPublisher {
    pub fn new(manager: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            manager,
            channel: channel.into(),
        }
    }
}

impl Publisher for RedisPublisher {
    async fn publish(&self, host: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .publish(&self.channel, host)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

/// Wake-up source for the orchestrator.
///
/// Pub/sub is not durable, so the live subscription is backed by queue
/// discovery: a full scan before the first message, again on a fixed
/// interval, and after every reconnect. A wake-up lost to a dropped
/// connection is therefore only a delay, never a stall.
pub struct RedisSubscriber {
    client: redis::Client,
    queue: RedisJobQueue,
    channel: String,
    discovery_interval: Duration,
}

impl RedisSubscriber {
    pub fn new(
        client: redis::Client,
        queue: RedisJobQueue,
        channel: impl Into<String>,
        discovery_interval: Duration,
    ) -> Self {
        Self {
            client,
            queue,
            channel: channel.into(),
            discovery_interval,
        }
    }

    /// One subscription lifetime: connect, subscribe, forward messages and
    /// periodic discovery results. `Ok` means shutdown, `Err` means the
    /// connection dropped and the caller should reconnect.
    async fn pump(
        client: &redis::Client,
        queue: &RedisJobQueue,
        channel: &str,
        discovery_interval: Duration,
        tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let mut pubsub = client.get_async_pubsub().await.map_err(redis_err)?;
        pubsub.subscribe(channel).await.map_err(redis_err)?;
        let mut messages = pubsub.into_on_message();

        let mut discovery = tokio::time::interval(discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = discovery.tick() => {
                    for host in queue.scan_queues().await? {
                        if tx.send(host).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        return Err(AppError::StoreError("Wake-up subscription closed".into()));
                    };
                    let host: String = msg.get_payload().map_err(redis_err)?;
                    if tx.send(host).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Subscriber for RedisSubscriber {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, AppError> {
        let (tx, rx) = mpsc::channel(64);

        let client = self.client.clone();
        let queue = self.queue.clone();
        let channel = self.channel.clone();
        let discovery_interval = self.discovery_interval;

        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match Self::pump(&client, &queue, &channel, discovery_interval, &tx, &cancel).await
                {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, delay = ?backoff, "Wake-up subscription lost, reconnecting");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
            tracing::debug!("Wake-up subscription stopped");
        });

        Ok(rx)
    }
}
