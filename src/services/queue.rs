use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::models::work_item::{DeadLetter, ObjectCreatedEvent, ObjectRef, ReceiptHandle, WorkItem};

/// At-least-once queue with visibility-timeout redelivery and a dead-letter
/// companion.
///
/// A received item stays invisible for the visibility timeout. If it is not
/// acknowledged in time it becomes receivable again, unless it has already
/// been delivered `max_receive_count` times, in which case it moves to the
/// dead-letter queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Fire-and-forget enqueue; returns the message id.
    async fn enqueue(&self, body: String) -> Result<Uuid, QueueError>;

    /// Up to `max_items` visible items, waiting at most `wait` for the first.
    async fn receive(&self, max_items: usize, wait: Duration) -> Result<Vec<WorkItem>, QueueError>;

    /// Permanently remove a delivered item.
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Oldest dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    /// Move up to `limit` dead letters back to the primary queue with a
    /// fresh delivery count.
    async fn redrive(&self, limit: usize) -> Result<usize, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Enqueue an object-created notification for `object`.
    async fn enqueue_object(&self, object: &ObjectRef) -> Result<Uuid, QueueError> {
        let body = ObjectCreatedEvent::for_object(object).to_body()?;
        self.enqueue(body).await
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

// KEYS: ready, in-flight, bodies, receive counts, dead letters
// ARGV: now_ms, visibility_ms, max_items, max_receive_count
const RECEIVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local visibility = tonumber(ARGV[2])
local max_items = tonumber(ARGV[3])
local max_receive = tonumber(ARGV[4])

local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  local count = tonumber(redis.call('HGET', KEYS[4], id) or '0')
  if count >= max_receive then
    local body = redis.call('HGET', KEYS[3], id)
    if body then
      redis.call('RPUSH', KEYS[5], cjson.encode({
        message_id = id, body = body, delivery_count = count, dead_lettered_at_ms = now
      }))
    end
    redis.call('HDEL', KEYS[3], id)
    redis.call('HDEL', KEYS[4], id)
  else
    redis.call('RPUSH', KEYS[1], id)
  end
end

local out = {}
local taken = 0
while taken < max_items do
  local id = redis.call('LPOP', KEYS[1])
  if not id then break end
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    local count = redis.call('HINCRBY', KEYS[4], id, 1)
    redis.call('ZADD', KEYS[2], now + visibility, id)
    table.insert(out, id)
    table.insert(out, tostring(count))
    table.insert(out, body)
    taken = taken + 1
  end
end
return out
"#;

// ARGV: message id, delivery count carried by the receipt
const ACK_SCRIPT: &str = r#"
local id = ARGV[1]
if not redis.call('ZSCORE', KEYS[2], id) then return 0 end
if redis.call('HGET', KEYS[4], id) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
redis.call('HDEL', KEYS[4], id)
return 1
"#;

// ARGV: limit
const REDRIVE_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local moved = 0
while moved < limit do
  local entry = redis.call('LPOP', KEYS[5])
  if not entry then break end
  local letter = cjson.decode(entry)
  redis.call('HSET', KEYS[3], letter.message_id, letter.body)
  redis.call('HSET', KEYS[4], letter.message_id, 0)
  redis.call('RPUSH', KEYS[1], letter.message_id)
  moved = moved + 1
end
return moved
"#;

#[derive(Debug, Deserialize)]
struct StoredDeadLetter {
    message_id: String,
    body: String,
    delivery_count: u32,
    dead_lettered_at_ms: f64,
}

impl TryFrom<StoredDeadLetter> for DeadLetter {
    type Error = QueueError;

    fn try_from(stored: StoredDeadLetter) -> Result<Self, Self::Error> {
        let message_id = Uuid::parse_str(&stored.message_id)
            .map_err(|_| QueueError::Corrupt(format!("dead letter id {}", stored.message_id)))?;
        let dead_lettered_at = Utc
            .timestamp_millis_opt(stored.dead_lettered_at_ms as i64)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(DeadLetter {
            message_id,
            body: stored.body,
            delivery_count: stored.delivery_count,
            dead_lettered_at,
        })
    }
}

/// Redis-backed work queue.
pub struct RedisQueue {
    client: redis::Client,
    name: String,
    keys: [String; 5],
    settings: QueueSettings,
    receive_script: redis::Script,
    ack_script: redis::Script,
    redrive_script: redis::Script,
}

impl RedisQueue {
    pub fn new(redis_url: &str, prefix: &str, name: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        let base = format!("{prefix}:{name}");
        Ok(Self {
            client,
            name: name.to_string(),
            keys: [
                format!("{base}:ready"),
                format!("{base}:in_flight"),
                format!("{base}:bodies"),
                format!("{base}:receives"),
                format!("{base}:dlq"),
            ],
            settings,
            receive_script: redis::Script::new(RECEIVE_SCRIPT),
            ack_script: redis::Script::new(ACK_SCRIPT),
            redrive_script: redis::Script::new(REDRIVE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    fn invocation<'a>(&'a self, script: &'a redis::Script) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in &self.keys {
            invocation.key(key);
        }
        invocation
    }

    async fn receive_now(&self, max_items: usize) -> Result<Vec<WorkItem>, QueueError> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis();
        let visibility_ms = self.settings.visibility_timeout.as_millis() as i64;

        let mut invocation = self.invocation(&self.receive_script);
        invocation
            .arg(now_ms)
            .arg(visibility_ms)
            .arg(max_items)
            .arg(self.settings.max_receive_count);
        let flat: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(QueueError::Redis)?;

        flat.chunks_exact(3)
            .map(|triple| {
                let message_id = Uuid::parse_str(&triple[0])
                    .map_err(|_| QueueError::Corrupt(format!("message id {}", triple[0])))?;
                let delivery_count: u32 = triple[1]
                    .parse()
                    .map_err(|_| QueueError::Corrupt(format!("delivery count {}", triple[1])))?;
                Ok(WorkItem {
                    message_id,
                    body: triple[2].clone(),
                    receipt: ReceiptHandle::new(message_id, delivery_count),
                    delivery_count,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, body: String) -> Result<Uuid, QueueError> {
        let mut conn = self.connection().await?;
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        redis::pipe()
            .atomic()
            .hset(&self.keys[2], &id_str, &body)
            .ignore()
            .rpush(&self.keys[0], &id_str)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        tracing::debug!(queue = %self.name, message_id = %id, "Enqueued message");
        Ok(id)
    }

    async fn receive(&self, max_items: usize, wait: Duration) -> Result<Vec<WorkItem>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let items = self.receive_now(max_items).await?;
            let now = Instant::now();
            if !items.is_empty() || now >= deadline {
                return Ok(items);
            }
            sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let (id, count) = receipt
            .parse()
            .ok_or_else(|| QueueError::InvalidReceipt(receipt.to_string()))?;
        let mut conn = self.connection().await?;
        let mut invocation = self.invocation(&self.ack_script);
        invocation.arg(id.to_string()).arg(count.to_string());
        let removed: i64 = invocation.invoke_async(&mut conn).await.map_err(QueueError::Redis)?;
        if removed == 0 {
            return Err(QueueError::ReceiptExpired(receipt.to_string()));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.connection().await?;
        let visible: u64 = conn.llen(&self.keys[0]).await.map_err(QueueError::Redis)?;
        let in_flight: u64 = conn.zcard(&self.keys[1]).await.map_err(QueueError::Redis)?;
        let dead_lettered: u64 = conn.llen(&self.keys[4]).await.map_err(QueueError::Redis)?;
        Ok(QueueDepth {
            visible,
            in_flight,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let entries: Vec<String> = conn
            .lrange(&self.keys[4], 0, limit as isize - 1)
            .await
            .map_err(QueueError::Redis)?;
        entries
            .iter()
            .map(|entry| {
                let stored: StoredDeadLetter = serde_json::from_str(entry)?;
                DeadLetter::try_from(stored)
            })
            .collect()
    }

    async fn redrive(&self, limit: usize) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.invocation(&self.redrive_script);
        invocation.arg(limit);
        let moved: usize = invocation.invoke_async(&mut conn).await.map_err(QueueError::Redis)?;
        Ok(moved)
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Receipt handle is malformed: {0}")]
    InvalidReceipt(String),

    #[error("Receipt handle no longer owns the message: {0}")]
    ReceiptExpired(String),

    #[error("Queue state is corrupt: {0}")]
    Corrupt(String),
}
