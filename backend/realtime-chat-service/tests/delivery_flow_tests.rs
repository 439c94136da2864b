mod common;

use common::{next_event, test_state};
use crypto_core::{CipherSession, KeyManager, OneTimePreKey, PublishKeysRequest, Sealed, SignedPreKey};
use realtime_chat_service::models::{conversation_id, DeliveryState};
use realtime_chat_service::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use realtime_chat_service::websocket::session::ConnectionSession;
use uuid::Uuid;

fn publish_request() -> PublishKeysRequest {
    PublishKeysRequest {
        identity_key: Vec::new(),
        signed_pre_key: SignedPreKey {
            key_id: 1,
            public_key: vec![7u8; 32],
            signature: Vec::new(),
        },
        one_time_pre_keys: (0..4)
            .map(|id| OneTimePreKey {
                key_id: id,
                public_key: vec![id as u8 + 1; 32],
            })
            .collect(),
    }
}

fn send_event(recipient_id: Uuid, ciphertext: &str, nonce: &str) -> WsInboundEvent {
    WsInboundEvent::SendMessage {
        recipient_id,
        ciphertext: ciphertext.to_string(),
        nonce: nonce.to_string(),
        content_type: None,
        conversation_id: None,
        client_message_id: None,
        expires_at: None,
    }
}

fn message_id_of(event: &WsOutboundEvent) -> Uuid {
    match event {
        WsOutboundEvent::MessageSent { message_id, .. } => *message_id,
        WsOutboundEvent::Message { message_id, .. } => *message_id,
        other => panic!("expected a message event, got {other:?}"),
    }
}

#[tokio::test]
async fn encrypted_message_reaches_offline_recipient_and_read_receipt_returns() {
    let (state, _) = test_state();
    let alice_keys = KeyManager::generate(Uuid::new_v4()).unwrap();
    let bob_keys = KeyManager::generate(Uuid::new_v4()).unwrap();
    let (alice, bob) = (alice_keys.user_id(), bob_keys.user_id());

    alice_keys
        .publish(state.keys.as_ref(), publish_request())
        .await
        .unwrap();
    bob_keys
        .publish(state.keys.as_ref(), publish_request())
        .await
        .unwrap();

    // Alice sends while Bob is offline.
    let (alice_session, mut alice_rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();
    let secret = alice_keys.secret_for(bob, state.keys.as_ref()).await.unwrap();
    let (ciphertext, nonce) = CipherSession::encrypt(&secret, b"hello").unwrap().to_wire();
    alice_session
        .dispatch(send_event(bob, &ciphertext, &nonce))
        .await
        .unwrap();

    let message_id = message_id_of(&next_event(&mut alice_rx).await);
    assert_eq!(state.router.offline().pending_count(bob).await.unwrap(), 1);

    // Bob connects and receives the queued envelope.
    let (bob_session, mut bob_rx) = ConnectionSession::open(state.clone(), bob).await.unwrap();
    let delivered = next_event(&mut bob_rx).await;
    let (ciphertext, nonce) = match &delivered {
        WsOutboundEvent::Message {
            message_id: id,
            sender_id,
            conversation_id: conv,
            ciphertext,
            nonce,
            ..
        } => {
            assert_eq!(*id, message_id);
            assert_eq!(*sender_id, alice);
            assert_eq!(*conv, conversation_id(alice, bob));
            (ciphertext.clone(), nonce.clone())
        }
        other => panic!("unexpected {other:?}"),
    };

    let secret = bob_keys.secret_for(alice, state.keys.as_ref()).await.unwrap();
    let sealed = Sealed::from_wire(&ciphertext, &nonce).unwrap();
    assert_eq!(CipherSession::open(&secret, &sealed).unwrap(), b"hello");

    bob_session
        .dispatch(WsInboundEvent::MessageRead { message_id })
        .await
        .unwrap();

    // Alice hears Bob come online, then the receipt.
    let receipt = loop {
        match next_event(&mut alice_rx).await {
            WsOutboundEvent::PresenceOnline { user_id, .. } => assert_eq!(user_id, bob),
            other => break other,
        }
    };
    match receipt {
        WsOutboundEvent::Receipt {
            message_id: id,
            status,
            ..
        } => {
            assert_eq!(id, message_id);
            assert_eq!(status, DeliveryState::Read);
        }
        other => panic!("unexpected {other:?}"),
    }

    // A late delivered ack cannot move the state backwards.
    bob_session
        .dispatch(WsInboundEvent::MessageDelivered { message_id })
        .await
        .unwrap();
    assert_eq!(
        state.acks.state(message_id).await.unwrap(),
        Some(DeliveryState::Read)
    );
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn queued_envelopes_drain_in_order_exactly_once() {
    let (state, _) = test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice_session, mut alice_rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..3 {
        alice_session
            .dispatch(send_event(bob, &format!("ct-{i}"), "bm9uY2U="))
            .await
            .unwrap();
        sent.push(message_id_of(&next_event(&mut alice_rx).await));
    }

    let (_phone, mut phone_rx) = ConnectionSession::open(state.clone(), bob).await.unwrap();
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(message_id_of(&next_event(&mut phone_rx).await));
    }
    assert_eq!(received, sent);

    // A second device does not trigger another drain.
    let (_laptop, mut laptop_rx) = ConnectionSession::open(state.clone(), bob).await.unwrap();
    assert!(laptop_rx.try_recv().is_err());
    assert!(state.router.offline().drain(bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn live_message_reaches_every_device_and_survives_one_disconnect() {
    let (state, _) = test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice_session, _alice_rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();
    let (phone, mut phone_rx) = ConnectionSession::open(state.clone(), bob).await.unwrap();
    let (_laptop, mut laptop_rx) = ConnectionSession::open(state.clone(), bob).await.unwrap();

    alice_session
        .dispatch(send_event(bob, "Y3Q=", "bm9uY2U="))
        .await
        .unwrap();
    let first = message_id_of(&next_event(&mut phone_rx).await);
    assert_eq!(message_id_of(&next_event(&mut laptop_rx).await), first);

    drop(phone);
    assert!(state.presence.is_online(bob));

    alice_session
        .dispatch(send_event(bob, "Y3Q=", "bm9uY2U="))
        .await
        .unwrap();
    let second = message_id_of(&next_event(&mut laptop_rx).await);
    assert_ne!(first, second);
    assert_eq!(state.router.offline().pending_count(bob).await.unwrap(), 0);
}

#[tokio::test]
async fn only_the_recipient_can_acknowledge() {
    let (state, _) = test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice_session, mut alice_rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();

    alice_session
        .dispatch(send_event(bob, "Y3Q=", "bm9uY2U="))
        .await
        .unwrap();
    let message_id = message_id_of(&next_event(&mut alice_rx).await);

    alice_session
        .dispatch(WsInboundEvent::MessageRead { message_id })
        .await
        .unwrap();
    assert_eq!(
        state.acks.state(message_id).await.unwrap(),
        Some(DeliveryState::Sent)
    );

    // Unknown ids are ignored without an error.
    alice_session
        .dispatch(WsInboundEvent::MessageDelivered {
            message_id: Uuid::new_v4(),
        })
        .await
        .unwrap();
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn typing_is_relayed_live_and_never_queued() {
    let (state, _) = test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice_session, _alice_rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();
    let conversation = conversation_id(alice, bob);

    alice_session
        .dispatch(WsInboundEvent::TypingStart {
            recipient_id: bob,
            conversation_id: conversation.clone(),
        })
        .await
        .unwrap();

    let (_bob_session, mut bob_rx) = ConnectionSession::open(state.clone(), bob).await.unwrap();
    assert!(bob_rx.try_recv().is_err());

    alice_session
        .dispatch(WsInboundEvent::TypingStop {
            recipient_id: bob,
            conversation_id: conversation.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut bob_rx).await,
        WsOutboundEvent::TypingStopped {
            sender_id: alice,
            conversation_id: conversation,
        }
    );
}

#[tokio::test]
async fn closing_last_session_records_last_seen_for_contacts() {
    let (state, _) = test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice_session, _alice_rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();
    let (bob_session, _bob_rx) = ConnectionSession::open(state.clone(), bob).await.unwrap();

    alice_session
        .dispatch(send_event(bob, "Y3Q=", "bm9uY2U="))
        .await
        .unwrap();

    let (mut watcher_rx, watcher) = {
        let (session, rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();
        (rx, session)
    };

    drop(bob_session);
    assert!(!state.presence.is_online(bob));
    let last_seen = state.presence.last_seen(bob).expect("last seen stamped");

    let offline = loop {
        match next_event(&mut watcher_rx).await {
            WsOutboundEvent::PresenceOffline {
                user_id, last_seen, ..
            } => break (user_id, last_seen),
            _ => continue,
        }
    };
    assert_eq!(offline, (bob, last_seen));
    drop(watcher);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sends_racing_a_connect_are_never_stranded() {
    const SENDS: usize = 40;

    let (state, _) = test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice_session, _alice_rx) = ConnectionSession::open(state.clone(), alice).await.unwrap();
    let alice_session = std::sync::Arc::new(alice_session);

    let sends = (0..SENDS).map(|i| {
        let session = alice_session.clone();
        tokio::spawn(async move {
            session
                .dispatch(send_event(bob, &format!("ct-{i}"), "bm9uY2U="))
                .await
        })
    });
    let connect = tokio::spawn({
        let state = state.clone();
        async move { ConnectionSession::open(state, bob).await }
    });

    for result in futures::future::join_all(sends).await {
        result.unwrap().unwrap();
    }
    let (_bob_session, mut bob_rx) = connect.await.unwrap().unwrap();

    let mut received = std::collections::HashSet::new();
    while received.len() < SENDS {
        received.insert(message_id_of(&next_event(&mut bob_rx).await));
    }
    assert_eq!(state.router.offline().pending_count(bob).await.unwrap(), 0);
}
