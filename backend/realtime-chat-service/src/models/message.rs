use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CONTENT_TYPE: &str = "text";

/// Conversation id for a direct conversation.
///
/// Both user ids are rendered in their hyphenated string form, sorted
/// lexicographically as strings, and joined with `:`, so either party computes
/// the same value.
pub fn conversation_id(a: Uuid, b: Uuid) -> String {
    let (a, b) = (a.to_string(), b.to_string());
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// One encrypted message in transit. Never mutated after construction.
///
/// `ciphertext` and `nonce` are the base64 strings the sender produced; the
/// server never decodes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub conversation_id: String,
    pub ciphertext: String,
    pub nonce: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MessageEnvelope {
    /// Stamp a new envelope with a server-assigned id and timestamp.
    pub fn new(
        sender_id: Uuid,
        recipient_id: Uuid,
        ciphertext: String,
        nonce: String,
        content_type: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            conversation_id: conversation_id(sender_id, recipient_id),
            ciphertext,
            nonce,
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            created_at: Utc::now(),
            expires_at,
        }
    }

    /// Sender-requested expiry, independent of offline retention.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Per-message delivery state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    /// `Delivered` is reachable only from `Sent`; `Read` from anything but itself.
    pub fn can_advance_to(self, target: DeliveryState) -> bool {
        matches!(
            (self, target),
            (DeliveryState::Sent, DeliveryState::Delivered)
                | (DeliveryState::Sent, DeliveryState::Read)
                | (DeliveryState::Delivered, DeliveryState::Read)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryState::Sent),
            "delivered" => Some(DeliveryState::Delivered),
            "read" => Some(DeliveryState::Read),
            _ => None,
        }
    }
}

/// Delivery bookkeeping for one routed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub state: DeliveryState,
}
