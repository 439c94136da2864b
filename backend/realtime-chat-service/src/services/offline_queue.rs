//! Per-recipient queue of envelopes waiting for the recipient to connect.
//!
//! Each entry carries its own retention deadline. Expiry is checked when the
//! queue is drained; nothing sweeps in the background.

use crate::error::{AppError, AppResult};
use crate::metrics::OFFLINE_EXPIRED_TOTAL;
use crate::models::MessageEnvelope;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    pub envelope: MessageEnvelope,
    /// Retention deadline; the entry is dropped at drain time once passed
    pub retain_until: DateTime<Utc>,
}

impl QueuedEnvelope {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.retain_until > now && !self.envelope.is_expired(now)
    }
}

/// Storage behind [`OfflineQueue`].
///
/// `take_all` must return and clear the recipient's entries as one
/// indivisible step: an entry pushed concurrently lands either in the
/// returned batch or in the next one, never in both and never in neither.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn push(&self, recipient_id: Uuid, entry: QueuedEnvelope) -> AppResult<()>;

    /// Put `entries` back at the head of the queue, ahead of anything pushed
    /// since, keeping their relative order and their deadlines.
    async fn push_front(&self, recipient_id: Uuid, entries: Vec<QueuedEnvelope>) -> AppResult<()>;

    /// Entries in insertion order; the queue is empty afterwards.
    async fn take_all(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEnvelope>>;

    async fn len(&self, recipient_id: Uuid) -> AppResult<usize>;
}

#[derive(Default)]
pub struct InMemoryOfflineStore {
    queues: DashMap<Uuid, VecDeque<QueuedEnvelope>>,
}

impl InMemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineStore for InMemoryOfflineStore {
    async fn push(&self, recipient_id: Uuid, entry: QueuedEnvelope) -> AppResult<()> {
        self.queues.entry(recipient_id).or_default().push_back(entry);
        Ok(())
    }

    async fn push_front(&self, recipient_id: Uuid, entries: Vec<QueuedEnvelope>) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut queue = self.queues.entry(recipient_id).or_default();
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
        Ok(())
    }

    async fn take_all(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEnvelope>> {
        Ok(self
            .queues
            .remove(&recipient_id)
            .map(|(_, queue)| queue.into())
            .unwrap_or_default())
    }

    async fn len(&self, recipient_id: Uuid) -> AppResult<usize> {
        Ok(self.queues.get(&recipient_id).map(|q| q.len()).unwrap_or(0))
    }
}

/// Redis list per recipient (`chat:offline:{user_id}`).
///
/// The list key expires one retention window after its most recent push, so
/// abandoned queues are reclaimed even if the recipient never returns.
pub struct RedisOfflineStore {
    redis: RedisClient,
    retention: Duration,
}

impl RedisOfflineStore {
    pub fn new(redis: RedisClient, retention: Duration) -> Self {
        Self { redis, retention }
    }

    pub fn key(recipient_id: Uuid) -> String {
        format!("chat:offline:{recipient_id}")
    }

    fn encode(entry: &QueuedEnvelope) -> AppResult<String> {
        serde_json::to_string(entry).map_err(|e| AppError::Redis(format!("encode: {e}")))
    }

    /// Undecodable items are logged and skipped rather than poisoning the batch.
    fn decode_all(recipient_id: Uuid, raw: Vec<String>) -> Vec<QueuedEnvelope> {
        raw.into_iter()
            .filter_map(|item| match serde_json::from_str(&item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(
                        recipient_id = %recipient_id,
                        error = %e,
                        "skipping undecodable offline entry"
                    );
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl OfflineStore for RedisOfflineStore {
    async fn push(&self, recipient_id: Uuid, entry: QueuedEnvelope) -> AppResult<()> {
        let key = Self::key(recipient_id);
        let payload = Self::encode(&entry)?;
        let mut conn = self.redis.connection();

        redis::pipe()
            .atomic()
            .rpush(&key, payload)
            .ignore()
            .expire(&key, self.retention.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_front(&self, recipient_id: Uuid, entries: Vec<QueuedEnvelope>) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let key = Self::key(recipient_id);
        // LPUSH inserts each value at the head in turn, so the last argument
        // ends up first.
        let payloads = entries
            .iter()
            .rev()
            .map(Self::encode)
            .collect::<AppResult<Vec<_>>>()?;
        let mut conn = self.redis.connection();

        redis::pipe()
            .atomic()
            .lpush(&key, payloads)
            .ignore()
            .expire(&key, self.retention.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn take_all(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEnvelope>> {
        let key = Self::key(recipient_id);
        let mut conn = self.redis.connection();

        let (raw, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await?;

        Ok(Self::decode_all(recipient_id, raw))
    }

    async fn len(&self, recipient_id: Uuid) -> AppResult<usize> {
        let mut conn = self.redis.connection();
        let len: usize = conn.llen(Self::key(recipient_id)).await?;
        Ok(len)
    }
}

/// Durable holding area for envelopes whose recipient has no open connection.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn OfflineStore>,
    retention: Duration,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn OfflineStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn enqueue(&self, recipient_id: Uuid, envelope: MessageEnvelope) -> AppResult<()> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| AppError::BadRequest(format!("retention out of range: {e}")))?;
        let message_id = envelope.id;

        self.store
            .push(
                recipient_id,
                QueuedEnvelope {
                    envelope,
                    retain_until: Utc::now() + retention,
                },
            )
            .await?;

        tracing::debug!(
            recipient_id = %recipient_id,
            message_id = %message_id,
            "queued envelope for offline recipient"
        );
        Ok(())
    }

    /// Take every pending envelope in FIFO order, dropping expired ones.
    /// The queue is empty afterwards.
    pub async fn drain(&self, recipient_id: Uuid) -> AppResult<Vec<MessageEnvelope>> {
        Ok(self
            .take_live(recipient_id)
            .await?
            .into_iter()
            .map(|e| e.envelope)
            .collect())
    }

    /// Like [`drain`](Self::drain), but keeps each entry's retention deadline
    /// so it can be handed back through [`requeue`](Self::requeue).
    pub async fn take_live(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEnvelope>> {
        let entries = self.store.take_all(recipient_id).await?;
        let total = entries.len();
        let now = Utc::now();

        let live: Vec<QueuedEnvelope> = entries.into_iter().filter(|e| e.is_live(now)).collect();

        let expired = total - live.len();
        if expired > 0 {
            OFFLINE_EXPIRED_TOTAL.inc_by(expired as u64);
        }
        if total > 0 {
            tracing::info!(
                recipient_id = %recipient_id,
                live = live.len(),
                expired,
                "drained offline queue"
            );
        }
        Ok(live)
    }

    /// Put drained entries back at the head of the queue with their original
    /// deadlines, so they keep their place ahead of newer envelopes.
    pub async fn requeue(&self, recipient_id: Uuid, entries: Vec<QueuedEnvelope>) -> AppResult<()> {
        let count = entries.len();
        self.store.push_front(recipient_id, entries).await?;
        if count > 0 {
            tracing::debug!(recipient_id = %recipient_id, count, "requeued undelivered envelopes");
        }
        Ok(())
    }

    pub async fn pending_count(&self, recipient_id: Uuid) -> AppResult<usize> {
        self.store.len(recipient_id).await
    }
}
