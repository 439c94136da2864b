//! Who hears about a user's presence changes.
//!
//! Contact lists themselves are owned elsewhere. The in-memory directory
//! learns pairs as messages are routed between users, and can be seeded
//! explicitly.

use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

pub trait ContactDirectory: Send + Sync {
    /// Users who should receive `user_id`'s presence transitions.
    fn contacts_of(&self, user_id: Uuid) -> Vec<Uuid>;

    /// Note that `a` and `b` are talking to each other.
    fn record_pair(&self, a: Uuid, b: Uuid);
}

#[derive(Default)]
pub struct InMemoryContactDirectory {
    pairs: DashMap<Uuid, HashSet<Uuid>>,
}

impl InMemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContactDirectory for InMemoryContactDirectory {
    fn contacts_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.pairs
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn record_pair(&self, a: Uuid, b: Uuid) {
        if a == b {
            return;
        }
        self.pairs.entry(a).or_default().insert(b);
        self.pairs.entry(b).or_default().insert(a);
    }
}
