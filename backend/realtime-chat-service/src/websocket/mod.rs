use crate::metrics::{FANOUT_FAILURES_TOTAL, ONLINE_USERS, OPEN_CONNECTIONS};
use crate::services::contacts::ContactDirectory;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

pub mod message_types;
pub mod session;

use message_types::WsOutboundEvent;

/// Unique identifier for one open connection
///
/// Each WebSocket connection gets a fresh id when it registers, so teardown
/// removes exactly that connection and never a sibling on another device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of one authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: HandleId,
    user_id: Uuid,
    sender: UnboundedSender<WsOutboundEvent>,
}

impl ConnectionHandle {
    pub fn new(user_id: Uuid) -> (Self, UnboundedReceiver<WsOutboundEvent>) {
        let (sender, rx) = unbounded_channel();
        (
            Self {
                id: HandleId::new(),
                user_id,
                sender,
            },
            rx,
        )
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Queue an event for this connection. `false` once the connection is gone.
    pub fn send(&self, event: WsOutboundEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

#[derive(Debug, Default)]
struct PresenceEntry {
    handles: Vec<ConnectionHandle>,
    last_seen: Option<DateTime<Utc>>,
    /// Bumped on every online/offline transition
    seq: u64,
}

/// Snapshot of one user's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub open_handles: usize,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Which connections are open for which user
///
/// Entries are sharded by user id; all mutation of one user's entry happens
/// under that shard's lock, and nothing is sent while it is held.
#[derive(Clone)]
pub struct PresenceDirectory {
    inner: Arc<DashMap<Uuid, PresenceEntry>>,
    contacts: Arc<dyn ContactDirectory>,
}

impl PresenceDirectory {
    pub fn new(contacts: Arc<dyn ContactDirectory>) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            contacts,
        }
    }

    pub fn contacts(&self) -> &Arc<dyn ContactDirectory> {
        &self.contacts
    }

    /// Add a connection. Returns `true` when this made the user come online.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let user_id = handle.user_id();
        let handle_id = handle.id();

        let (came_online, seq, total) = {
            let mut entry = self.inner.entry(user_id).or_default();
            if entry.handles.iter().any(|h| h.id == handle_id) {
                return false;
            }
            let came_online = entry.handles.is_empty();
            if came_online {
                entry.seq += 1;
            }
            entry.handles.push(handle);
            (came_online, entry.seq, entry.handles.len())
        };

        OPEN_CONNECTIONS.inc();
        tracing::debug!(
            user_id = %user_id,
            handle_id = ?handle_id,
            total,
            "registered connection"
        );

        if came_online {
            ONLINE_USERS.inc();
            tracing::info!(user_id = %user_id, seq, "user online");
            self.notify_contacts(user_id, WsOutboundEvent::PresenceOnline { user_id, seq });
        }
        came_online
    }

    /// Remove a connection. Returns `true` when this made the user go offline.
    ///
    /// Unknown users and handles are ignored, so calling this twice is harmless.
    pub fn unregister(&self, user_id: Uuid, handle_id: HandleId) -> bool {
        let went_offline_at = {
            let Some(mut entry) = self.inner.get_mut(&user_id) else {
                return false;
            };
            let before = entry.handles.len();
            entry.handles.retain(|h| h.id != handle_id);
            if entry.handles.len() == before {
                return false;
            }
            OPEN_CONNECTIONS.dec();

            if entry.handles.is_empty() {
                let now = Utc::now();
                entry.last_seen = Some(now);
                entry.seq += 1;
                Some((now, entry.seq))
            } else {
                None
            }
        };

        tracing::debug!(user_id = %user_id, handle_id = ?handle_id, "unregistered connection");

        match went_offline_at {
            Some((last_seen, seq)) => {
                ONLINE_USERS.dec();
                tracing::info!(user_id = %user_id, seq, "user offline");
                self.notify_contacts(
                    user_id,
                    WsOutboundEvent::PresenceOffline {
                        user_id,
                        last_seen,
                        seq,
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .get(&user_id)
            .map(|e| !e.handles.is_empty())
            .unwrap_or(false)
    }

    /// Clones of the user's open handles, taken under the shard lock.
    pub fn open_handles(&self, user_id: Uuid) -> Vec<ConnectionHandle> {
        self.inner
            .get(&user_id)
            .map(|e| e.handles.clone())
            .unwrap_or_default()
    }

    pub fn last_seen(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner.get(&user_id).and_then(|e| e.last_seen)
    }

    pub fn record(&self, user_id: Uuid) -> Option<PresenceRecord> {
        self.inner.get(&user_id).map(|e| PresenceRecord {
            user_id,
            open_handles: e.handles.len(),
            is_online: !e.handles.is_empty(),
            last_seen: e.last_seen,
        })
    }

    /// Send `event` to every open connection of `user_id`.
    ///
    /// Returns how many connections accepted it. Closed connections are
    /// counted and skipped; their sessions unregister themselves.
    pub fn send_to_user(&self, user_id: Uuid, event: &WsOutboundEvent) -> usize {
        fan_out(&self.open_handles(user_id), event)
    }

    fn notify_contacts(&self, user_id: Uuid, event: WsOutboundEvent) {
        for contact in self.contacts.contacts_of(user_id) {
            self.send_to_user(contact, &event);
        }
    }
}

/// Best-effort delivery of one event to a set of handles.
pub fn fan_out(handles: &[ConnectionHandle], event: &WsOutboundEvent) -> usize {
    let mut delivered = 0;
    for handle in handles {
        if handle.send(event.clone()) {
            delivered += 1;
        } else {
            FANOUT_FAILURES_TOTAL.inc();
            tracing::debug!(
                user_id = %handle.user_id(),
                handle_id = ?handle.id(),
                "dropped event for closed connection"
            );
        }
    }
    delivered
}
