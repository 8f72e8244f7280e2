use redis::AsyncCommands;
use uuid::Uuid;

use hermes_core::traits::JobQueue;
use hermes_store::RedisJobQueue;

use crate::integration::common::setup_redis;

#[tokio::test]
async fn dequeue_preserves_enqueue_order() {
    let (_client, manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager);

    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        queue.enqueue("db-01", *id).await.unwrap();
    }

    for id in &ids {
        assert_eq!(queue.dequeue("db-01").await.unwrap(), Some(*id));
    }
    assert_eq!(queue.dequeue("db-01").await.unwrap(), None);
}

#[tokio::test]
async fn queues_are_isolated_per_host() {
    let (_client, manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager);

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    queue.enqueue("db-01", a).await.unwrap();
    queue.enqueue("db-02", b).await.unwrap();

    assert_eq!(queue.dequeue("db-02").await.unwrap(), Some(b));
    assert_eq!(queue.dequeue("db-01").await.unwrap(), Some(a));
}

#[tokio::test]
async fn index_tracks_non_empty_queues() {
    let (_client, manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager);

    queue.enqueue("db-01", Uuid::new_v4()).await.unwrap();
    assert_eq!(queue.get_queues().await.unwrap(), vec!["db-01".to_string()]);

    queue.dequeue("db-01").await.unwrap();
    assert!(queue.get_queues().await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_first_jumps_the_line() {
    let (_client, manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager);

    let waiting = Uuid::new_v4();
    let drained = Uuid::new_v4();
    queue.enqueue("db-01", waiting).await.unwrap();
    queue.enqueue_first("db-01", drained).await.unwrap();

    assert_eq!(queue.dequeue("db-01").await.unwrap(), Some(drained));
    assert_eq!(queue.dequeue("db-01").await.unwrap(), Some(waiting));
}

#[tokio::test]
async fn scan_queues_heals_a_lost_index() {
    let (_client, mut manager, _container) = setup_redis().await;
    let queue = RedisJobQueue::new(manager.clone());

    queue.enqueue("db-01", Uuid::new_v4()).await.unwrap();

    // Simulate an index lost ahead of its queue.
    let _: i64 = manager.srem("queues", "db-01").await.unwrap();
    assert!(queue.get_queues().await.unwrap().is_empty());

    assert_eq!(queue.scan_queues().await.unwrap(), vec!["db-01".to_string()]);
    assert_eq!(queue.get_queues().await.unwrap(), vec!["db-01".to_string()]);
}
