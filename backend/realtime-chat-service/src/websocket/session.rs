//! One authenticated connection, from open to teardown.
//!
//! [`ConnectionSession`] is transport-agnostic: it binds presence, drains the
//! offline queue and dispatches parsed events. [`serve`] drives it over a
//! WebSocket stream with a sequential receive loop, so events from one
//! connection are handled in the order they arrived.

use crate::error::{AppError, AppResult};
use crate::models::{conversation_id, MessageEnvelope};
use crate::services::idempotency::{PriorSend, SendClaim};
use crate::state::AppState;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::{ConnectionHandle, HandleId, PresenceDirectory};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// Unregisters the connection however the session ends, including unwinding.
struct PresenceGuard {
    presence: PresenceDirectory,
    user_id: Uuid,
    handle_id: HandleId,
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.presence.unregister(self.user_id, self.handle_id);
    }
}

pub struct ConnectionSession {
    user_id: Uuid,
    handle: ConnectionHandle,
    state: AppState,
    _presence: PresenceGuard,
}

impl ConnectionSession {
    /// Register the connection and hand it anything queued while the user was
    /// offline. The returned receiver carries every event bound for this
    /// connection, replies included.
    pub async fn open(
        state: AppState,
        user_id: Uuid,
    ) -> AppResult<(Self, UnboundedReceiver<WsOutboundEvent>)> {
        let (handle, rx) = ConnectionHandle::new(user_id);
        let came_online = state.presence.register(handle.clone());

        let session = Self {
            user_id,
            _presence: PresenceGuard {
                presence: state.presence.clone(),
                user_id,
                handle_id: handle.id(),
            },
            handle,
            state,
        };

        if came_online {
            if let Err(e) = session.state.router.flush_offline(user_id).await {
                tracing::error!(user_id = %user_id, error = %e, "failed to drain offline queue");
            }
        }

        tracing::info!(user_id = %user_id, handle_id = ?session.handle.id(), "session opened");
        Ok((session, rx))
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle.id()
    }

    fn reply(&self, event: WsOutboundEvent) {
        self.handle.send(event);
    }

    fn reply_error(&self, err: &AppError) {
        self.reply(WsOutboundEvent::error(err.code(), err.public_message()));
    }

    /// Parse and dispatch one text frame. Failures are reported back on this
    /// connection as an `error` event and never end the session.
    pub async fn handle_text(&self, text: &str) {
        let event = match serde_json::from_str::<WsInboundEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(user_id = %self.user_id, error = %e, "unparseable frame");
                self.reply_error(&AppError::BadRequest(format!("invalid event: {e}")));
                return;
            }
        };

        if let Err(e) = self.dispatch(event).await {
            tracing::warn!(user_id = %self.user_id, error = %e, "event handling failed");
            self.reply_error(&e);
        }
    }

    pub async fn dispatch(&self, event: WsInboundEvent) -> AppResult<()> {
        match event {
            WsInboundEvent::SendMessage {
                recipient_id,
                ciphertext,
                nonce,
                content_type,
                conversation_id,
                client_message_id,
                expires_at,
            } => {
                self.send_message(OutgoingMessage {
                    recipient_id,
                    ciphertext,
                    nonce,
                    content_type,
                    conversation_id,
                    client_message_id,
                    expires_at,
                })
                .await
            }

            WsInboundEvent::TypingStart {
                recipient_id,
                conversation_id,
            } => {
                self.state
                    .typing
                    .start_typing(self.user_id, recipient_id, &conversation_id);
                Ok(())
            }

            WsInboundEvent::TypingStop {
                recipient_id,
                conversation_id,
            } => {
                self.state
                    .typing
                    .stop_typing(self.user_id, recipient_id, &conversation_id);
                Ok(())
            }

            WsInboundEvent::MessageDelivered { message_id } => {
                self.state
                    .acks
                    .mark_delivered(self.user_id, message_id)
                    .await?;
                Ok(())
            }

            WsInboundEvent::MessageRead { message_id } => {
                self.state.acks.mark_read(self.user_id, message_id).await?;
                Ok(())
            }

            WsInboundEvent::Ping => {
                self.reply(WsOutboundEvent::Pong);
                Ok(())
            }
        }
    }

    async fn send_message(&self, msg: OutgoingMessage) -> AppResult<()> {
        if msg.recipient_id == self.user_id {
            return Err(AppError::BadRequest("cannot send a message to yourself".into()));
        }
        if msg.ciphertext.is_empty() || msg.nonce.is_empty() {
            return Err(AppError::BadRequest("ciphertext and nonce are required".into()));
        }
        let expected = conversation_id(self.user_id, msg.recipient_id);
        if msg.conversation_id.as_deref().is_some_and(|c| c != expected) {
            return Err(AppError::BadRequest(
                "conversation_id does not match participants".into(),
            ));
        }

        let envelope = MessageEnvelope::new(
            self.user_id,
            msg.recipient_id,
            msg.ciphertext,
            msg.nonce,
            msg.content_type,
            msg.expires_at,
        );

        if let Some(client_id) = msg.client_message_id.as_deref() {
            let claim = self.state.dedup.claim(
                self.user_id,
                client_id,
                PriorSend {
                    message_id: envelope.id,
                    conversation_id: envelope.conversation_id.clone(),
                    accepted_at: envelope.created_at,
                },
            );
            if let SendClaim::Duplicate(prior) = claim {
                self.reply(WsOutboundEvent::MessageSent {
                    message_id: prior.message_id,
                    client_message_id: msg.client_message_id,
                    conversation_id: prior.conversation_id,
                    timestamp: prior.accepted_at,
                });
                return Ok(());
            }
        }

        let sent = WsOutboundEvent::MessageSent {
            message_id: envelope.id,
            client_message_id: msg.client_message_id.clone(),
            conversation_id: envelope.conversation_id.clone(),
            timestamp: envelope.created_at,
        };

        if let Err(e) = self.state.router.route(envelope).await {
            if let Some(client_id) = msg.client_message_id.as_deref() {
                self.state.dedup.release(self.user_id, client_id);
            }
            return Err(e);
        }

        self.reply(sent);
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        tracing::info!(user_id = %self.user_id, handle_id = ?self.handle.id(), "session closed");
    }
}

struct OutgoingMessage {
    recipient_id: Uuid,
    ciphertext: String,
    nonce: String,
    content_type: Option<String>,
    conversation_id: Option<String>,
    client_message_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// Drive an accepted WebSocket for `user_id` until it closes, errors, or goes
/// quiet for longer than the idle timeout.
pub async fn serve<S>(ws: WebSocketStream<S>, state: AppState, user_id: Uuid)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle_timeout = state.config.idle_timeout;
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    let (mut sink, mut stream) = ws.split();

    let (session, mut outbound) = match ConnectionSession::open(state, user_id).await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "failed to open session");
            let _ = sink.close().await;
            return;
        }
    };

    heartbeat.tick().await;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        session.handle_text(&text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_activity = Instant::now();
                        session.reply_error(&AppError::BadRequest(
                            "binary frames are not supported".into(),
                        ));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(reason))) => {
                        tracing::debug!(user_id = %user_id, ?reason, "client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(user_id = %user_id, error = %e, "websocket read failed");
                        break;
                    }
                    None => break,
                }
            }

            Some(event) = outbound.recv() => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(user_id = %user_id, error = %e, "failed to encode event");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(payload)).await {
                    tracing::debug!(user_id = %user_id, error = %e, "websocket write failed");
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    tracing::info!(user_id = %user_id, "closing idle connection");
                    break;
                }
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(session);
    let _ = sink.close().await;
}
