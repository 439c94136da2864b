use crate::error::{AppError, AppResult};
use crate::metrics::RECEIPTS_TOTAL;
use crate::models::{DeliveryRecord, DeliveryState, MessageEnvelope};
use crate::redis_client::RedisClient;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::PresenceDirectory;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Storage behind [`AckTracker`].
#[async_trait]
pub trait DeliveryStateStore: Send + Sync {
    /// Start tracking a routed envelope in `Sent`.
    async fn record(&self, record: DeliveryRecord) -> AppResult<()>;

    async fn get(&self, message_id: Uuid) -> AppResult<Option<DeliveryRecord>>;

    /// Compare-and-advance in one step. Returns the updated record when the
    /// transition was accepted, `None` for unknown ids and rejected moves.
    async fn advance(
        &self,
        message_id: Uuid,
        target: DeliveryState,
    ) -> AppResult<Option<DeliveryRecord>>;
}

/// Prune roughly once every this many recorded sends.
const PRUNE_EVERY: u64 = 256;

struct StoredRecord {
    record: DeliveryRecord,
    recorded_at: Instant,
}

/// Process-local receipts. Each record lives for `ttl` after it was first
/// recorded, matching the key expiry of [`RedisDeliveryStore`].
pub struct InMemoryDeliveryStore {
    records: DashMap<Uuid, StoredRecord>,
    ttl: Duration,
    writes: AtomicU64,
}

impl InMemoryDeliveryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
            writes: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, stored: &StoredRecord) -> bool {
        stored.recorded_at.elapsed() >= self.ttl
    }

    pub fn prune_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, stored| stored.recorded_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            tracing::debug!(removed, "pruned expired delivery records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DeliveryStateStore for InMemoryDeliveryStore {
    async fn record(&self, record: DeliveryRecord) -> AppResult<()> {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_expired();
        }

        let fresh = StoredRecord {
            record,
            recorded_at: Instant::now(),
        };
        match self.records.entry(fresh.record.message_id) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get()) {
                    occupied.insert(fresh);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(())
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<DeliveryRecord>> {
        Ok(self
            .records
            .get(&message_id)
            .filter(|stored| !self.is_expired(stored))
            .map(|stored| stored.record.clone()))
    }

    async fn advance(
        &self,
        message_id: Uuid,
        target: DeliveryState,
    ) -> AppResult<Option<DeliveryRecord>> {
        let Some(mut stored) = self.records.get_mut(&message_id) else {
            return Ok(None);
        };
        if self.is_expired(&stored) || !stored.record.state.can_advance_to(target) {
            return Ok(None);
        }
        stored.record.state = target;
        Ok(Some(stored.record.clone()))
    }
}

/// Returns `{sender, recipient}` when the move was applied, nil otherwise.
static ADVANCE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local current = redis.call('HGET', KEYS[1], 'state')
        if not current then
            return nil
        end
        local target = ARGV[1]
        if target == 'delivered' and current ~= 'sent' then
            return nil
        end
        if target == 'read' and current == 'read' then
            return nil
        end
        redis.call('HSET', KEYS[1], 'state', target)
        return redis.call('HMGET', KEYS[1], 'sender', 'recipient')
        "#,
    )
});

/// One hash per message (`chat:receipt:{message_id}`) with `sender`,
/// `recipient` and `state` fields. Transitions run as a Lua script so
/// concurrent acks from several devices cannot move the state backwards.
pub struct RedisDeliveryStore {
    redis: RedisClient,
    ttl: Duration,
}

impl RedisDeliveryStore {
    pub fn new(redis: RedisClient, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    pub fn key(message_id: Uuid) -> String {
        format!("chat:receipt:{message_id}")
    }

    fn parse_ids(message_id: Uuid, sender: &str, recipient: &str) -> AppResult<(Uuid, Uuid)> {
        let sender = Uuid::parse_str(sender)
            .map_err(|e| AppError::Redis(format!("receipt {message_id} sender: {e}")))?;
        let recipient = Uuid::parse_str(recipient)
            .map_err(|e| AppError::Redis(format!("receipt {message_id} recipient: {e}")))?;
        Ok((sender, recipient))
    }
}

#[async_trait]
impl DeliveryStateStore for RedisDeliveryStore {
    async fn record(&self, record: DeliveryRecord) -> AppResult<()> {
        let key = Self::key(record.message_id);
        let mut conn = self.redis.connection();

        redis::pipe()
            .atomic()
            .hset_nx(&key, "sender", record.sender_id.to_string())
            .ignore()
            .hset_nx(&key, "recipient", record.recipient_id.to_string())
            .ignore()
            .hset_nx(&key, "state", record.state.as_str())
            .ignore()
            .expire(&key, self.ttl.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<DeliveryRecord>> {
        let mut conn = self.redis.connection();
        let (sender, recipient, state): (Option<String>, Option<String>, Option<String>) = conn
            .hget(Self::key(message_id), &["sender", "recipient", "state"])
            .await?;

        let (Some(sender), Some(recipient), Some(state)) = (sender, recipient, state) else {
            return Ok(None);
        };
        let (sender_id, recipient_id) = Self::parse_ids(message_id, &sender, &recipient)?;
        let state = DeliveryState::parse(&state)
            .ok_or_else(|| AppError::Redis(format!("receipt {message_id} state: {state}")))?;

        Ok(Some(DeliveryRecord {
            message_id,
            sender_id,
            recipient_id,
            state,
        }))
    }

    async fn advance(
        &self,
        message_id: Uuid,
        target: DeliveryState,
    ) -> AppResult<Option<DeliveryRecord>> {
        let mut conn = self.redis.connection();
        let applied: Option<(String, String)> = ADVANCE_SCRIPT
            .key(Self::key(message_id))
            .arg(target.as_str())
            .invoke_async(&mut conn)
            .await?;

        let Some((sender, recipient)) = applied else {
            return Ok(None);
        };
        let (sender_id, recipient_id) = Self::parse_ids(message_id, &sender, &recipient)?;
        Ok(Some(DeliveryRecord {
            message_id,
            sender_id,
            recipient_id,
            state: target,
        }))
    }
}

/// Tracks Sent → Delivered → Read per message and tells the sender.
#[derive(Clone)]
pub struct AckTracker {
    store: Arc<dyn DeliveryStateStore>,
    presence: PresenceDirectory,
}

impl AckTracker {
    pub fn new(store: Arc<dyn DeliveryStateStore>, presence: PresenceDirectory) -> Self {
        Self { store, presence }
    }

    pub async fn record_sent(&self, envelope: &MessageEnvelope) -> AppResult<()> {
        self.store
            .record(DeliveryRecord {
                message_id: envelope.id,
                sender_id: envelope.sender_id,
                recipient_id: envelope.recipient_id,
                state: DeliveryState::Sent,
            })
            .await
    }

    pub async fn mark_delivered(
        &self,
        acting_user: Uuid,
        message_id: Uuid,
    ) -> AppResult<Option<DeliveryState>> {
        self.transition(acting_user, message_id, DeliveryState::Delivered)
            .await
    }

    pub async fn mark_read(
        &self,
        acting_user: Uuid,
        message_id: Uuid,
    ) -> AppResult<Option<DeliveryState>> {
        self.transition(acting_user, message_id, DeliveryState::Read)
            .await
    }

    pub async fn state(&self, message_id: Uuid) -> AppResult<Option<DeliveryState>> {
        Ok(self.store.get(message_id).await?.map(|r| r.state))
    }

    /// Unknown ids, acks from anyone but the recipient, and backward or
    /// repeated moves are all ignored and return `None`.
    async fn transition(
        &self,
        acting_user: Uuid,
        message_id: Uuid,
        target: DeliveryState,
    ) -> AppResult<Option<DeliveryState>> {
        let Some(record) = self.store.get(message_id).await? else {
            tracing::debug!(message_id = %message_id, "ack for unknown message ignored");
            return Ok(None);
        };
        if record.recipient_id != acting_user {
            tracing::warn!(
                message_id = %message_id,
                acting_user = %acting_user,
                "ack from non-recipient ignored"
            );
            return Ok(None);
        }

        let Some(updated) = self.store.advance(message_id, target).await? else {
            return Ok(None);
        };

        RECEIPTS_TOTAL.with_label_values(&[target.as_str()]).inc();
        let notified = self.presence.send_to_user(
            updated.sender_id,
            &WsOutboundEvent::Receipt {
                message_id,
                status: target,
                timestamp: Utc::now(),
            },
        );
        tracing::debug!(
            message_id = %message_id,
            status = target.as_str(),
            notified,
            "delivery state advanced"
        );
        Ok(Some(target))
    }
}
