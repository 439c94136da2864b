//! Device identity and per-peer shared secrets.
//!
//! A [`KeyManager`] is created once per local identity and passed explicitly to
//! whatever needs it; there is no process-wide key cache. Shared secrets are
//! derived as `HKDF-SHA256(X25519(local_private, peer_public))` and are cached
//! until the peer's public key changes or the manager is cleared on logout.

use crate::prekeys::{KeyDirectory, PublishKeysRequest};
use crate::{ensure_key_len, CryptoError, CryptoResult};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an X25519 public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

const MESSAGE_KEY_INFO: &[u8] = b"nova-realtime-chat/v1/message-key";

/// Local identity key pair. The private half never leaves this struct.
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity from the OS entropy source.
    ///
    /// Fails only when the entropy source is unavailable; callers should treat
    /// that as fatal at startup.
    pub fn generate() -> CryptoResult<Self> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Entropy(e.to_string()))?;
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    fn agree(&self, peer_public: [u8; PUBLIC_KEY_LEN]) -> CryptoResult<SharedSecret> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKey);
        }

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(MESSAGE_KEY_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(SharedSecret(okm))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Symmetric key shared with exactly one peer. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

struct PeerEntry {
    public_key: [u8; PUBLIC_KEY_LEN],
    secret: SharedSecret,
}

/// Owns one identity and the per-peer key cache.
pub struct KeyManager {
    user_id: Uuid,
    identity: IdentityKeyPair,
    peers: RwLock<HashMap<Uuid, PeerEntry>>,
}

impl KeyManager {
    pub fn new(user_id: Uuid, identity: IdentityKeyPair) -> Self {
        Self {
            user_id,
            identity,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a manager with a freshly generated identity.
    pub fn generate(user_id: Uuid) -> CryptoResult<Self> {
        Ok(Self::new(user_id, IdentityKeyPair::generate()?))
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.identity.public_key()
    }

    /// Cache a peer's public key and (re)derive the shared secret for it.
    ///
    /// Malformed or weak keys are rejected and leave any previous entry intact.
    pub fn store_peer_key(&self, peer_id: Uuid, public_key: &[u8]) -> CryptoResult<()> {
        let public_key = ensure_key_len(public_key)?;

        if self.peer_key(peer_id) == Some(public_key) {
            return Ok(());
        }

        let secret = self.identity.agree(public_key)?;
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = peers
            .insert(peer_id, PeerEntry { public_key, secret })
            .is_some();

        tracing::debug!(
            user_id = %self.user_id,
            peer_id = %peer_id,
            replaced,
            "derived shared secret for peer"
        );
        Ok(())
    }

    /// Cached secret for `peer_id`, or `NoKeyMaterial` if the peer is unknown.
    pub fn get_shared_secret(&self, peer_id: Uuid) -> CryptoResult<SharedSecret> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer_id)
            .map(|entry| entry.secret.clone())
            .ok_or(CryptoError::NoKeyMaterial(peer_id))
    }

    pub fn peer_key(&self, peer_id: Uuid) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer_id)
            .map(|entry| entry.public_key)
    }

    /// Return the cached secret, fetching the peer's bundle from the key
    /// directory on a miss.
    pub async fn secret_for(
        &self,
        peer_id: Uuid,
        directory: &dyn KeyDirectory,
    ) -> CryptoResult<SharedSecret> {
        match self.get_shared_secret(peer_id) {
            Err(CryptoError::NoKeyMaterial(_)) => {}
            other => return other,
        }

        self.fetch_peer_key(peer_id, directory).await?;
        self.get_shared_secret(peer_id)
    }

    /// Look the peer up in the key directory and cache its identity key.
    pub async fn fetch_peer_key(
        &self,
        peer_id: Uuid,
        directory: &dyn KeyDirectory,
    ) -> CryptoResult<()> {
        let bundle = directory
            .fetch_bundle(peer_id)
            .await?
            .ok_or(CryptoError::NoKeyMaterial(peer_id))?;

        tracing::debug!(
            user_id = %self.user_id,
            peer_id = %peer_id,
            one_time_key = bundle.one_time_pre_key.as_ref().map(|k| k.key_id),
            "fetched prekey bundle"
        );
        self.store_peer_key(peer_id, &bundle.identity_key)
    }

    /// Publish this identity to the key directory.
    pub async fn publish(
        &self,
        directory: &dyn KeyDirectory,
        mut request: PublishKeysRequest,
    ) -> CryptoResult<()> {
        request.identity_key = self.public_key().to_vec();
        directory.publish(self.user_id, request).await
    }

    pub fn forget_peer(&self, peer_id: Uuid) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer_id);
    }

    /// Drop every cached peer key and secret (logout).
    pub fn clear(&self) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("user_id", &self.user_id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
