use crate::models::conversation_id;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::PresenceDirectory;
use uuid::Uuid;

/// Forwards typing indicators to the recipient's open connections.
///
/// Nothing is stored or queued; an offline recipient simply misses the event.
#[derive(Clone)]
pub struct TypingRelay {
    presence: PresenceDirectory,
}

impl TypingRelay {
    pub fn new(presence: PresenceDirectory) -> Self {
        Self { presence }
    }

    pub fn start_typing(&self, sender_id: Uuid, recipient_id: Uuid, conversation: &str) -> usize {
        self.relay(sender_id, recipient_id, conversation, true)
    }

    pub fn stop_typing(&self, sender_id: Uuid, recipient_id: Uuid, conversation: &str) -> usize {
        self.relay(sender_id, recipient_id, conversation, false)
    }

    fn relay(&self, sender_id: Uuid, recipient_id: Uuid, conversation: &str, started: bool) -> usize {
        if sender_id == recipient_id || conversation != conversation_id(sender_id, recipient_id) {
            tracing::debug!(
                sender_id = %sender_id,
                recipient_id = %recipient_id,
                conversation_id = conversation,
                "typing event for mismatched conversation dropped"
            );
            return 0;
        }

        let conversation_id = conversation.to_string();
        let event = if started {
            WsOutboundEvent::TypingStarted {
                sender_id,
                conversation_id,
            }
        } else {
            WsOutboundEvent::TypingStopped {
                sender_id,
                conversation_id,
            }
        };
        self.presence.send_to_user(recipient_id, &event)
    }
}
