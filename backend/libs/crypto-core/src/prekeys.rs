//! Prekey bundles and the key-directory boundary.
//!
//! The directory hands out each one-time prekey at most once. Implementations
//! must make "pick a key and remove it from the pool" a single atomic step and
//! must refuse to re-admit a key id that has already been issued.

use crate::{ensure_key_len, CryptoError, CryptoResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Medium-term prekey, signed by the owner's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_id: u32,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "b64", default)]
    pub signature: Vec<u8>,
}

/// Single-use prekey (consumed on issuance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub key_id: u32,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

/// What a requester receives when looking a user up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_key: Option<OneTimePreKey>,
}

/// Key material a device uploads about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishKeysRequest {
    #[serde(with = "b64")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKey,
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKey>,
}

impl PublishKeysRequest {
    pub fn validate(&self) -> CryptoResult<()> {
        ensure_key_len(&self.identity_key)?;
        ensure_key_len(&self.signed_pre_key.public_key)?;
        for key in &self.one_time_pre_keys {
            ensure_key_len(&key.public_key)?;
        }
        Ok(())
    }
}

/// Server-side store of published key material.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Bundle for `user_id` with at most one freshly claimed one-time prekey,
    /// or `None` if the user never published.
    async fn fetch_bundle(&self, user_id: Uuid) -> CryptoResult<Option<PrekeyBundle>>;

    /// Replace the identity and signed prekey; append new one-time prekeys.
    async fn publish(&self, user_id: Uuid, request: PublishKeysRequest) -> CryptoResult<()>;

    /// Unclaimed one-time prekeys left for `user_id`.
    async fn one_time_key_count(&self, user_id: Uuid) -> CryptoResult<usize>;
}

struct DirectoryEntry {
    identity_key: Vec<u8>,
    signed_pre_key: SignedPreKey,
    pool: VecDeque<OneTimePreKey>,
    seen: HashSet<u32>,
}

/// Process-local key directory; the whole map sits behind one async mutex so
/// claim-and-remove is atomic.
#[derive(Default)]
pub struct InMemoryKeyDirectory {
    users: Mutex<HashMap<Uuid, DirectoryEntry>>,
}

impl InMemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyDirectory for InMemoryKeyDirectory {
    async fn fetch_bundle(&self, user_id: Uuid) -> CryptoResult<Option<PrekeyBundle>> {
        let mut users = self.users.lock().await;
        let Some(entry) = users.get_mut(&user_id) else {
            return Ok(None);
        };

        let one_time_pre_key = entry.pool.pop_front();
        if one_time_pre_key.is_none() {
            tracing::warn!(user_id = %user_id, "one-time prekey pool exhausted");
        }

        Ok(Some(PrekeyBundle {
            user_id,
            identity_key: entry.identity_key.clone(),
            signed_pre_key: entry.signed_pre_key.clone(),
            one_time_pre_key,
        }))
    }

    async fn publish(&self, user_id: Uuid, request: PublishKeysRequest) -> CryptoResult<()> {
        request.validate()?;

        let mut users = self.users.lock().await;
        let entry = users.entry(user_id).or_insert_with(|| DirectoryEntry {
            identity_key: Vec::new(),
            signed_pre_key: request.signed_pre_key.clone(),
            pool: VecDeque::new(),
            seen: HashSet::new(),
        });

        entry.identity_key = request.identity_key;
        entry.signed_pre_key = request.signed_pre_key;

        let mut added = 0usize;
        for key in request.one_time_pre_keys {
            if entry.seen.insert(key.key_id) {
                entry.pool.push_back(key);
                added += 1;
            }
        }

        tracing::info!(
            user_id = %user_id,
            added,
            remaining = entry.pool.len(),
            "published prekeys"
        );
        Ok(())
    }

    async fn one_time_key_count(&self, user_id: Uuid) -> CryptoResult<usize> {
        let users = self.users.lock().await;
        Ok(users.get(&user_id).map(|e| e.pool.len()).unwrap_or(0))
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
