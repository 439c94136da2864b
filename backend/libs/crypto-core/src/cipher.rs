//! AES-256-GCM over a per-peer [`SharedSecret`].
//!
//! Nonces are drawn from the OS entropy source inside [`CipherSession::encrypt`];
//! callers cannot supply their own, so a nonce is never reused under one key by
//! construction.

use crate::keys::SharedSecret;
use crate::{CryptoError, CryptoResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Ciphertext (with appended tag) and the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

impl Sealed {
    /// Base64 `(ciphertext, nonce)` pair for the wire.
    pub fn to_wire(&self) -> (String, String) {
        (BASE64.encode(&self.ciphertext), BASE64.encode(self.nonce))
    }

    /// Parse a wire pair. Anything malformed is undecryptable.
    pub fn from_wire(ciphertext: &str, nonce: &str) -> CryptoResult<Self> {
        let ciphertext = BASE64
            .decode(ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailure)?;
        let nonce = BASE64
            .decode(nonce)
            .map_err(|_| CryptoError::AuthenticationFailure)?;
        let nonce =
            <[u8; NONCE_LEN]>::try_from(nonce).map_err(|_| CryptoError::AuthenticationFailure)?;
        Ok(Self { ciphertext, nonce })
    }
}

/// Stateless authenticated encryption keyed by a shared secret.
pub struct CipherSession;

impl CipherSession {
    pub fn encrypt(secret: &SharedSecret, plaintext: &[u8]) -> CryptoResult<Sealed> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|e| CryptoError::Entropy(e.to_string()))?;

        let ciphertext = cipher(secret)
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        Ok(Sealed { ciphertext, nonce })
    }

    /// Verify and decrypt. Any tampering, wrong key, or malformed nonce yields
    /// `AuthenticationFailure` and no plaintext.
    pub fn decrypt(secret: &SharedSecret, ciphertext: &[u8], nonce: &[u8]) -> CryptoResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::AuthenticationFailure);
        }

        cipher(secret)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailure)
    }

    pub fn open(secret: &SharedSecret, sealed: &Sealed) -> CryptoResult<Vec<u8>> {
        Self::decrypt(secret, &sealed.ciphertext, &sealed.nonce)
    }
}

fn cipher(secret: &SharedSecret) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SharedSecret {
        SharedSecret::from_bytes([42u8; 32])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let s = secret();
        let sealed = CipherSession::encrypt(&s, b"hello").unwrap();
        assert_eq!(CipherSession::open(&s, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let s = secret();
        let a = CipherSession::encrypt(&s, b"same").unwrap();
        let b = CipherSession::encrypt(&s, b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let sealed = CipherSession::encrypt(&secret(), b"hello").unwrap();
        let other = SharedSecret::from_bytes([7u8; 32]);
        assert_eq!(
            CipherSession::open(&other, &sealed).unwrap_err(),
            CryptoError::AuthenticationFailure
        );
    }

    #[test]
    fn test_short_nonce_fails_authentication() {
        let sealed = CipherSession::encrypt(&secret(), b"hello").unwrap();
        assert_eq!(
            CipherSession::decrypt(&secret(), &sealed.ciphertext, &sealed.nonce[..8]).unwrap_err(),
            CryptoError::AuthenticationFailure
        );
    }

    #[test]
    fn test_wire_encoding_rejects_garbage() {
        assert_eq!(
            Sealed::from_wire("not base64!!", "AAAA").unwrap_err(),
            CryptoError::AuthenticationFailure
        );

        let sealed = CipherSession::encrypt(&secret(), b"hi").unwrap();
        let (ct, nonce) = sealed.to_wire();
        assert_eq!(Sealed::from_wire(&ct, &nonce).unwrap(), sealed);
    }
}
