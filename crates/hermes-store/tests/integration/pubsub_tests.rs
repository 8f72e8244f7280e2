use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hermes_core::traits::{JobQueue, Publisher, Subscriber};
use hermes_store::{RedisJobQueue, RedisPublisher, RedisSubscriber};

use crate::integration::common::setup_redis;

const CHANNEL: &str = "batch:hosts";

#[tokio::test]
async fn publish_wakes_subscriber() {
    let (client, manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager.clone());
    let subscriber = RedisSubscriber::new(client, queue, CHANNEL, Duration::from_secs(300));
    let publisher = RedisPublisher::new(manager, CHANNEL);

    let cancel = CancellationToken::new();
    let mut hosts = subscriber.subscribe(cancel.child_token()).await.unwrap();

    // Give the background task time to attach before publishing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    publisher.publish("db-01").await.unwrap();

    let host = timeout(Duration::from_secs(5), hosts.recv())
        .await
        .expect("no wake-up arrived")
        .expect("channel closed");
    assert_eq!(host, "db-01");

    cancel.cancel();
}

#[tokio::test]
async fn discovery_finds_queues_without_a_wakeup() {
    let (client, manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager);

    // Work enqueued before any subscriber existed; its wake-up is gone.
    queue.enqueue("db-02", Uuid::new_v4()).await.unwrap();

    let subscriber = RedisSubscriber::new(client, queue, CHANNEL, Duration::from_millis(100));
    let cancel = CancellationToken::new();
    let mut hosts = subscriber.subscribe(cancel.child_token()).await.unwrap();

    let host = timeout(Duration::from_secs(5), hosts.recv())
        .await
        .expect("discovery never ran")
        .expect("channel closed");
    assert_eq!(host, "db-02");

    cancel.cancel();
}

#[tokio::test]
async fn cancellation_closes_the_channel() {
    let (client, manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager);
    let subscriber = RedisSubscriber::new(client, queue, CHANNEL, Duration::from_secs(300));

    let cancel = CancellationToken::new();
    let mut hosts = subscriber.subscribe(cancel.child_token()).await.unwrap();
    cancel.cancel();

    let closed = timeout(Duration::from_secs(5), hosts.recv())
        .await
        .expect("subscription did not shut down");
    assert!(closed.is_none());
}
