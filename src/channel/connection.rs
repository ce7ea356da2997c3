//! Per-connection task: one read loop per client, outbound frames drained
//! from the connection's own queue.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use crate::channel::hub::{ConnectionId, Delivery, Outbox};
use crate::channel::message::{ClientMessage, EventFilter, EventKind, ServerMessage};
use crate::error::{Error, Result};
use crate::session::SessionManager;
use crate::signaling::SessionDescription;

struct Connection {
    id: ConnectionId,
    sessions: Arc<SessionManager>,
    tx: Outbox,
    bound: Option<String>,
    max_message_bytes: usize,
}

/// Drives one control-channel connection until the client goes away.
///
/// Leaving only detaches this connection from its session's fan-out; the
/// session itself stays open for other subscribers.
pub async fn handle_socket(
    socket: WebSocket,
    sessions: Arc<SessionManager>,
    principal: String,
    max_message_bytes: usize,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = Outbox::channel();
    let eviction = tx.eviction();

    let mut connection = Connection {
        id: Uuid::new_v4(),
        sessions,
        tx,
        bound: None,
        max_message_bytes,
    };
    tracing::info!(
        connection_id = %connection.id,
        principal = %principal,
        "Control channel opened"
    );

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                match message.to_json() {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("Failed to encode control message: {}", e),
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => connection.handle_text(&text).await,
                    Some(Ok(Message::Binary(_))) => connection.reply_error(&Error::Unsupported(
                        "binary frames are not part of the control protocol".to_string(),
                    )),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection.id, "WebSocket error: {}", e);
                        if is_oversized(&e) {
                            let _ = ws_tx
                                .send(close(close_code::SIZE, "frame exceeds hard cap"))
                                .await;
                        }
                        break;
                    }
                }
            }
            _ = eviction.notified() => {
                tracing::warn!(connection_id = %connection.id, "Outbound queue full, closing connection");
                let _ = ws_tx
                    .send(close(close_code::POLICY, "client is not reading"))
                    .await;
                break;
            }
        }
    }

    if let Some(session_id) = connection.bound.take() {
        connection
            .sessions
            .hub()
            .unsubscribe(&session_id, connection.id)
            .await;
    }
    tracing::info!(connection_id = %connection.id, "Control channel closed");
}

fn close(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// The socket refuses frames above its hard cap with a capacity error.
fn is_oversized(err: &axum::Error) -> bool {
    err.to_string().starts_with("Space limit exceeded")
}

impl Connection {
    async fn handle_text(&mut self, text: &str) {
        if text.len() > self.max_message_bytes {
            self.reply_error(&Error::MessageTooLarge {
                size: text.len(),
                limit: self.max_message_bytes,
            });
            return;
        }

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection_id = %self.id, "Rejected inbound message: {}", e);
                self.reply_error(&e);
                return;
            }
        };

        if let Err(e) = self.dispatch(message).await {
            self.reply_error(&e);
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<()> {
        let message = match message {
            ClientMessage::Subscribe { session_id, events } => {
                return self.subscribe(session_id, &events).await;
            }
            ClientMessage::Ping => {
                self.reply(ServerMessage::Pong);
                return Ok(());
            }
            other => other,
        };

        let session_id = self.bound_session()?;
        self.sessions.touch(&session_id).await?;

        match message {
            ClientMessage::PtzCommand(command) => {
                self.sessions.submit_ptz(&session_id, command).await?;
            }
            ClientMessage::StreamControl(control) => {
                self.sessions.stream_control(&session_id, control).await?;
            }
            ClientMessage::GetStats => {
                self.sessions.publish_current_stats(&session_id).await?;
            }
            ClientMessage::Offer { sdp } => self.spawn_negotiation(session_id, sdp),
            ClientMessage::IceCandidate(candidate) => {
                self.sessions
                    .add_ice_candidate(&session_id, candidate)
                    .await?;
            }
            ClientMessage::Subscribe { .. } | ClientMessage::Ping => {}
        }
        Ok(())
    }

    async fn subscribe(&mut self, session_id: String, events: &[EventKind]) -> Result<()> {
        self.sessions.touch(&session_id).await?;

        self.sessions
            .hub()
            .rebind(
                self.id,
                self.bound.as_deref(),
                &session_id,
                self.tx.clone(),
                EventFilter::from_events(events),
            )
            .await;

        tracing::info!(
            connection_id = %self.id,
            session_id = %session_id,
            previous = ?self.bound,
            "Connection subscribed"
        );
        self.bound = Some(session_id.clone());
        self.reply(ServerMessage::Connected { session_id });
        Ok(())
    }

    /// Negotiation may be slow; the answer comes back on this connection's queue.
    fn spawn_negotiation(&self, session_id: String, sdp: String) {
        let sessions = Arc::clone(&self.sessions);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let reply = match sessions
                .submit_offer(&session_id, SessionDescription::offer(sdp))
                .await
            {
                Ok(answer) => ServerMessage::Answer {
                    session_id,
                    sdp: answer.sdp,
                },
                Err(e) => ServerMessage::error(&e),
            };
            tx.deliver(reply);
        });
    }

    fn bound_session(&self) -> Result<String> {
        self.bound.clone().ok_or_else(|| {
            Error::InvalidState("subscribe to a session before sending commands".to_string())
        })
    }

    fn reply(&self, message: ServerMessage) {
        if self.tx.deliver(message) == Delivery::Stalled {
            tracing::debug!(connection_id = %self.id, "Reply found the outbound queue full");
        }
    }

    fn reply_error(&self, error: &Error) {
        self.reply(ServerMessage::error(error));
    }
}
