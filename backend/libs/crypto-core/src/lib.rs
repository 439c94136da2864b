//! Client-side key agreement and message encryption for realtime chat.
//!
//! - [`KeyManager`] owns one device identity and caches a shared secret per peer.
//! - [`CipherSession`] seals and opens messages under a shared secret.
//! - [`KeyDirectory`] is the server-side prekey store consulted on a cache miss.
//! - [`jwt`] validates the bearer credential presented on connection open.

pub mod cipher;
pub mod jwt;
pub mod keys;
pub mod prekeys;

pub use cipher::{CipherSession, Sealed, NONCE_LEN};
pub use keys::{IdentityKeyPair, KeyManager, SharedSecret, PUBLIC_KEY_LEN};
pub use prekeys::{
    InMemoryKeyDirectory, KeyDirectory, OneTimePreKey, PrekeyBundle, PublishKeysRequest,
    SignedPreKey,
};

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("entropy source failure: {0}")]
    Entropy(String),

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("peer public key produces a non-contributory agreement")]
    WeakKey,

    #[error("no key material for peer {0}")]
    NoKeyMaterial(Uuid),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encryption,

    #[error("message authentication failed")]
    AuthenticationFailure,

    #[error("key directory error: {0}")]
    KeyDirectory(String),

    /// Key material that could not be parsed, such as a malformed PEM
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("unauthorized")]
    Unauthorized,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Reject anything that is not exactly one X25519 public key.
pub(crate) fn ensure_key_len(bytes: &[u8]) -> CryptoResult<[u8; PUBLIC_KEY_LEN]> {
    <[u8; PUBLIC_KEY_LEN]>::try_from(bytes).map_err(|_| CryptoError::InvalidKeyLength {
        expected: PUBLIC_KEY_LEN,
        actual: bytes.len(),
    })
}
