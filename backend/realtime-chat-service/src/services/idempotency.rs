//! Send deduplication
//!
//! Clients retry `message.send` after a dropped connection without knowing
//! whether the first attempt landed. A send that carries a `client_message_id`
//! is remembered per sender for a bounded window; a resubmission inside the
//! window is answered with the original message id and is not routed again.
//!
//! Expired entries are pruned probabilistically on the write path, so the map
//! stays bounded without a background task.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Prune roughly once every this many claims.
const PRUNE_EVERY: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorSend {
    pub message_id: Uuid,
    pub conversation_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendClaim {
    /// First time this key is seen; route it
    Fresh,
    /// Already accepted inside the window
    Duplicate(PriorSend),
}

#[derive(Debug, Clone)]
struct DedupEntry {
    prior: PriorSend,
    created_at: Instant,
}

impl DedupEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

pub struct SendDeduplicator {
    seen: DashMap<(Uuid, String), DedupEntry>,
    ttl: Duration,
    claims: AtomicU64,
}

impl SendDeduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
            claims: AtomicU64::new(0),
        }
    }

    /// Atomically claim `(sender, client_message_id)` for `prior`.
    pub fn claim(&self, sender_id: Uuid, client_message_id: &str, prior: PriorSend) -> SendClaim {
        if self.claims.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_expired();
        }

        match self.seen.entry((sender_id, client_message_id.to_string())) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(self.ttl) {
                    occupied.insert(DedupEntry {
                        prior,
                        created_at: Instant::now(),
                    });
                    SendClaim::Fresh
                } else {
                    tracing::debug!(
                        sender_id = %sender_id,
                        client_message_id,
                        "duplicate send suppressed"
                    );
                    SendClaim::Duplicate(occupied.get().prior.clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DedupEntry {
                    prior,
                    created_at: Instant::now(),
                });
                SendClaim::Fresh
            }
        }
    }

    /// Forget a claim whose send failed, so a retry is routed.
    pub fn release(&self, sender_id: Uuid, client_message_id: &str) {
        self.seen.remove(&(sender_id, client_message_id.to_string()));
    }

    pub fn prune_expired(&self) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, entry| !entry.is_expired(self.ttl));
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.seen.len(), "pruned send dedup entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
