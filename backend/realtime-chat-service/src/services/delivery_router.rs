use crate::error::AppResult;
use crate::metrics::MESSAGES_ROUTED_TOTAL;
use crate::models::MessageEnvelope;
use crate::services::ack_tracker::AckTracker;
use crate::services::offline_queue::OfflineQueue;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::{fan_out, PresenceDirectory};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to this many open connections of the recipient
    Delivered { handles: usize },
    /// Went through the offline queue, and is still there if no open
    /// connection took it
    Queued,
}

/// Sends an envelope to every open connection of its recipient, or parks it in
/// the offline queue.
///
/// Routing and draining for one recipient run under that recipient's lock, and
/// a live send never skips past envelopes still waiting in the queue.
#[derive(Clone)]
pub struct DeliveryRouter {
    presence: PresenceDirectory,
    offline: OfflineQueue,
    acks: AckTracker,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DeliveryRouter {
    pub fn new(presence: PresenceDirectory, offline: OfflineQueue, acks: AckTracker) -> Self {
        Self {
            presence,
            offline,
            acks,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    pub async fn route(&self, envelope: MessageEnvelope) -> AppResult<RouteOutcome> {
        let recipient_id = envelope.recipient_id;
        self.acks.record_sent(&envelope).await?;
        self.presence
            .contacts()
            .record_pair(envelope.sender_id, recipient_id);

        let lock = self.lock_for(recipient_id);
        let result = {
            let _guard = lock.lock().await;
            self.route_locked(envelope).await
        };
        drop(lock);
        self.release(recipient_id);
        result
    }

    /// Drain the recipient's queue onto their open connections, oldest first.
    ///
    /// Anything no connection accepted goes back to the head of the queue with
    /// its original deadline. Returns the number of envelopes handed out.
    pub async fn flush_offline(&self, recipient_id: Uuid) -> AppResult<usize> {
        let lock = self.lock_for(recipient_id);
        let result = {
            let _guard = lock.lock().await;
            self.flush_locked(recipient_id).await
        };
        drop(lock);
        self.release(recipient_id);
        result
    }

    async fn route_locked(&self, envelope: MessageEnvelope) -> AppResult<RouteOutcome> {
        let recipient_id = envelope.recipient_id;
        let handles = self.presence.open_handles(recipient_id);

        if !handles.is_empty() && self.offline.pending_count(recipient_id).await? == 0 {
            let delivered = fan_out(&handles, &WsOutboundEvent::from(&envelope));
            if delivered > 0 {
                MESSAGES_ROUTED_TOTAL.with_label_values(&["live"]).inc();
                tracing::debug!(
                    message_id = %envelope.id,
                    recipient_id = %recipient_id,
                    handles = delivered,
                    "routed envelope live"
                );
                return Ok(RouteOutcome::Delivered { handles: delivered });
            }
        }

        let message_id = envelope.id;
        self.offline.enqueue(recipient_id, envelope).await?;
        MESSAGES_ROUTED_TOTAL.with_label_values(&["queued"]).inc();
        tracing::debug!(
            message_id = %message_id,
            recipient_id = %recipient_id,
            "envelope queued"
        );

        // Older envelopes are still queued for a connected recipient; push the
        // whole backlog out in order.
        if self.presence.is_online(recipient_id) {
            self.flush_locked(recipient_id).await?;
        }

        Ok(RouteOutcome::Queued)
    }

    async fn flush_locked(&self, recipient_id: Uuid) -> AppResult<usize> {
        let drained = self.offline.take_live(recipient_id).await?;
        if drained.is_empty() {
            return Ok(0);
        }

        let handles = self.presence.open_handles(recipient_id);
        let mut pending = drained.into_iter();
        let mut flushed = 0;
        while let Some(entry) = pending.next() {
            if fan_out(&handles, &WsOutboundEvent::from(&entry.envelope)) == 0 {
                let mut undelivered = vec![entry];
                undelivered.extend(pending.by_ref());
                self.offline.requeue(recipient_id, undelivered).await?;
                break;
            }
            flushed += 1;
        }

        tracing::debug!(recipient_id = %recipient_id, flushed, "flushed offline queue");
        Ok(flushed)
    }

    fn lock_for(&self, recipient_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(recipient_id).or_default().clone()
    }

    /// Forget the recipient's lock once nobody holds or waits on it.
    fn release(&self, recipient_id: Uuid) {
        self.locks
            .remove_if(&recipient_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
