use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use hermes_core::error::AppError;
use hermes_core::traits::JobQueue;

use crate::redis_err;

/// Pops one id and de-indexes the host in the same atomic step when the
/// queue runs dry, so the host index never points at an empty queue.
const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if id == false then
    redis.call('SREM', KEYS[2], ARGV[1])
    return false
end
if redis.call('LLEN', KEYS[1]) == 0 then
    redis.call('SREM', KEYS[2], ARGV[1])
end
return id
"#;

const QUEUE_PREFIX: &str = "queue:";
const HOST_INDEX: &str = "queues";

fn queue_key(host: &str) -> String {
    format!("{QUEUE_PREFIX}{host}")
}

/// Per-host FIFO lists under `queue:{host}`, indexed by the `queues` set.
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    dequeue_script: Script,
}

impl RedisJobQueue {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
        }
    }
}

impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, host: &str, id: Uuid) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .lpush(queue_key(host), id.to_string())
            .ignore()
            .sadd(HOST_INDEX, host)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn dequeue(&self, host: &str) -> Result<Option<Uuid>, AppError> {
        let mut conn = self.manager.clone();
        let popped: Option<String> = self
            .dequeue_script
            .key(queue_key(host))
            .key(HOST_INDEX)
            .arg(host)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        popped
            .map(|raw| {
                raw.parse::<Uuid>()
                    .map_err(|_| AppError::StoreError(format!("Corrupt queue entry '{raw}'")))
            })
            .transpose()
    }

    async fn enqueue_first(&self, host: &str, id: Uuid) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .rpush(queue_key(host), id.to_string())
            .ignore()
            .sadd(HOST_INDEX, host)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn get_queues(&self) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        conn.smembers(HOST_INDEX).await.map_err(redis_err)
    }

    async fn scan_queues(&self) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(format!("{QUEUE_PREFIX}*"))
                .await
                .map_err(redis_err)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut hosts = Vec::with_capacity(keys.len());
        for key in keys {
            let host = key[QUEUE_PREFIX.len()..].to_string();
            hosts.push(host);
        }

        if !hosts.is_empty() {
            // Heal the index for any queue a crashed writer left behind.
            let _: i64 = conn.sadd(HOST_INDEX, &hosts).await.map_err(redis_err)?;
        }
        Ok(hosts)
    }
}
