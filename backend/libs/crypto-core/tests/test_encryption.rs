use crypto_core::{CipherSession, CryptoError, KeyManager, Sealed, NONCE_LEN};
use uuid::Uuid;

fn paired() -> (KeyManager, KeyManager) {
    let alice = KeyManager::generate(Uuid::new_v4()).expect("alice");
    let bob = KeyManager::generate(Uuid::new_v4()).expect("bob");
    alice
        .store_peer_key(bob.user_id(), &bob.public_key())
        .expect("store bob");
    bob.store_peer_key(alice.user_id(), &alice.public_key())
        .expect("store alice");
    (alice, bob)
}

#[test]
fn roundtrip_between_two_identities() {
    let (alice, bob) = paired();
    let secret = alice.get_shared_secret(bob.user_id()).unwrap();
    let sealed = CipherSession::encrypt(&secret, "hello".as_bytes()).unwrap();

    let (ct, nonce) = sealed.to_wire();
    let received = Sealed::from_wire(&ct, &nonce).unwrap();
    let bob_secret = bob.get_shared_secret(alice.user_id()).unwrap();
    let plaintext = CipherSession::open(&bob_secret, &received).unwrap();

    assert_eq!(String::from_utf8(plaintext).unwrap(), "hello");
    assert_eq!(received.nonce.len(), NONCE_LEN);
}

#[test]
fn any_single_bit_flip_fails_authentication() {
    let (alice, bob) = paired();
    let secret = alice.get_shared_secret(bob.user_id()).unwrap();
    let sealed = CipherSession::encrypt(&secret, b"attack at dawn").unwrap();

    for byte in 0..sealed.ciphertext.len() {
        let mut tampered = sealed.clone();
        tampered.ciphertext[byte] ^= 0x01;
        assert_eq!(
            CipherSession::open(&secret, &tampered).unwrap_err(),
            CryptoError::AuthenticationFailure,
            "ciphertext byte {byte}"
        );
    }

    for byte in 0..NONCE_LEN {
        let mut tampered = sealed.clone();
        tampered.nonce[byte] ^= 0x80;
        assert_eq!(
            CipherSession::open(&secret, &tampered).unwrap_err(),
            CryptoError::AuthenticationFailure,
            "nonce byte {byte}"
        );
    }
}

#[test]
fn third_party_cannot_open() {
    let (alice, bob) = paired();
    let eve = KeyManager::generate(Uuid::new_v4()).unwrap();
    eve.store_peer_key(alice.user_id(), &alice.public_key())
        .unwrap();

    let secret = alice.get_shared_secret(bob.user_id()).unwrap();
    let sealed = CipherSession::encrypt(&secret, b"private").unwrap();
    let eve_secret = eve.get_shared_secret(alice.user_id()).unwrap();

    assert!(CipherSession::open(&eve_secret, &sealed).is_err());
}

#[test]
fn empty_plaintext_is_sealed() {
    let (alice, bob) = paired();
    let secret = alice.get_shared_secret(bob.user_id()).unwrap();
    let sealed = CipherSession::encrypt(&secret, b"").unwrap();
    // 16-byte GCM tag only
    assert_eq!(sealed.ciphertext.len(), 16);
    assert!(CipherSession::open(&secret, &sealed).unwrap().is_empty());
}
