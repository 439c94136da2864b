use crate::models::{DeliveryState, MessageEnvelope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket events from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    #[serde(rename = "message.send")]
    SendMessage {
        recipient_id: Uuid,
        /// Base64 AES-GCM ciphertext; opaque to the server
        ciphertext: String,
        /// Base64 96-bit nonce
        nonce: String,
        #[serde(default)]
        content_type: Option<String>,
        /// Optional; when present it must match the computed pair id
        #[serde(default)]
        conversation_id: Option<String>,
        /// Client-chosen idempotency key for resubmission
        #[serde(default)]
        client_message_id: Option<String>,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },

    #[serde(rename = "typing.start")]
    TypingStart {
        recipient_id: Uuid,
        conversation_id: String,
    },

    #[serde(rename = "typing.stop")]
    TypingStop {
        recipient_id: Uuid,
        conversation_id: String,
    },

    #[serde(rename = "message.delivered")]
    MessageDelivered { message_id: Uuid },

    #[serde(rename = "message.read")]
    MessageRead { message_id: Uuid },

    #[serde(rename = "ping")]
    Ping,
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsOutboundEvent {
    #[serde(rename = "message")]
    Message {
        message_id: Uuid,
        sender_id: Uuid,
        conversation_id: String,
        ciphertext: String,
        nonce: String,
        content_type: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },

    /// Confirms to the sender that the server accepted a send
    #[serde(rename = "message.sent")]
    MessageSent {
        message_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "receipt")]
    Receipt {
        message_id: Uuid,
        status: DeliveryState,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "typing.started")]
    TypingStarted {
        sender_id: Uuid,
        conversation_id: String,
    },

    #[serde(rename = "typing.stopped")]
    TypingStopped {
        sender_id: Uuid,
        conversation_id: String,
    },

    /// `seq` increases with every online/offline transition of `user_id`;
    /// clients drop presence events older than the last one they applied.
    #[serde(rename = "presence.online")]
    PresenceOnline { user_id: Uuid, seq: u64 },

    #[serde(rename = "presence.offline")]
    PresenceOffline {
        user_id: Uuid,
        last_seen: DateTime<Utc>,
        seq: u64,
    },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl From<&MessageEnvelope> for WsOutboundEvent {
    fn from(envelope: &MessageEnvelope) -> Self {
        WsOutboundEvent::Message {
            message_id: envelope.id,
            sender_id: envelope.sender_id,
            conversation_id: envelope.conversation_id.clone(),
            ciphertext: envelope.ciphertext.clone(),
            nonce: envelope.nonce.clone(),
            content_type: envelope.content_type.clone(),
            timestamp: envelope.created_at,
            expires_at: envelope.expires_at,
        }
    }
}

impl WsOutboundEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        WsOutboundEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_with_optional_fields_missing() {
        let recipient = Uuid::new_v4();
        let evt: WsInboundEvent = serde_json::from_value(json!({
            "type": "message.send",
            "recipient_id": recipient,
            "ciphertext": "Y3Q=",
            "nonce": "bm9uY2U=",
        }))
        .unwrap();

        match evt {
            WsInboundEvent::SendMessage {
                recipient_id,
                content_type,
                client_message_id,
                ..
            } => {
                assert_eq!(recipient_id, recipient);
                assert!(content_type.is_none());
                assert!(client_message_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_receipts_and_ping() {
        let id = Uuid::new_v4();
        let read: WsInboundEvent =
            serde_json::from_value(json!({"type": "message.read", "message_id": id})).unwrap();
        assert_eq!(read, WsInboundEvent::MessageRead { message_id: id });

        let ping: WsInboundEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, WsInboundEvent::Ping);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<WsInboundEvent>(r#"{"type":"call.start"}"#).is_err());
    }

    #[test]
    fn test_outbound_wire_shape() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(WsOutboundEvent::Receipt {
            message_id: id,
            status: DeliveryState::Read,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(value["type"], "receipt");
        assert_eq!(value["status"], "read");

        let pong = serde_json::to_value(WsOutboundEvent::Pong).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));
    }

    #[test]
    fn test_message_event_from_envelope() {
        let env = MessageEnvelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Y3Q=".into(),
            "bm9uY2U=".into(),
            Some("image".into()),
            None,
        );
        let value = serde_json::to_value(WsOutboundEvent::from(&env)).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["message_id"], json!(env.id));
        assert_eq!(value["content_type"], "image");
        assert!(value.get("expires_at").is_none());
    }
}
