use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::channel::message::{EventFilter, ServerMessage};

pub type ConnectionId = Uuid;

/// Messages a connection may have waiting before it counts as stalled.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Bounded sending half of one connection's outbound queue.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
    evicted: Arc<Notify>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::Receiver<ServerMessage>) {
        Self::with_capacity(OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbox = Self {
            tx,
            evicted: Arc::new(Notify::new()),
        };
        (outbox, rx)
    }

    /// Queues without waiting. A full queue drops `stats` snapshots; anything
    /// else marks the connection as stalled.
    pub fn deliver(&self, message: ServerMessage) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(message)) if message.is_droppable() => Delivery::Dropped,
            Err(TrySendError::Full(_)) => {
                self.evicted.notify_one();
                Delivery::Stalled
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Resolves once a delivery found the queue full.
    pub fn eviction(&self) -> Arc<Notify> {
        self.evicted.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Dropped,
    Stalled,
    Closed,
}

struct Subscriber {
    outbox: Outbox,
    filter: EventFilter,
}

/// Per-session fan-out of control-channel events.
///
/// Each subscriber has its own bounded queue, so every subscriber sees a
/// session's events in production order. A subscriber that stops reading is
/// removed rather than buffered without limit.
#[derive(Default)]
pub struct EventHub {
    sessions: RwLock<HashMap<String, HashMap<ConnectionId, Subscriber>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        outbox: Outbox,
        filter: EventFilter,
    ) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id, Subscriber { outbox, filter });
    }

    /// Detaches from `previous` and attaches to `session_id` under one lock.
    pub async fn rebind(
        &self,
        connection_id: ConnectionId,
        previous: Option<&str>,
        session_id: &str,
        outbox: Outbox,
        filter: EventFilter,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(previous) = previous {
            remove_subscriber(&mut sessions, previous, connection_id);
        }
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id, Subscriber { outbox, filter });
    }

    pub async fn unsubscribe(&self, session_id: &str, connection_id: ConnectionId) {
        let mut sessions = self.sessions.write().await;
        remove_subscriber(&mut sessions, session_id, connection_id);
    }

    /// Drops every subscriber of a session. Returns how many were removed.
    pub async fn remove_session(&self, session_id: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id).map_or(0, |s| s.len())
    }

    /// Delivers to every subscriber of the session whose filter allows it.
    /// Returns the number of subscribers reached.
    pub async fn publish(&self, session_id: &str, message: ServerMessage) -> usize {
        let mut gone = Vec::new();
        let mut delivered = 0;

        {
            let sessions = self.sessions.read().await;
            let Some(subscribers) = sessions.get(session_id) else {
                return 0;
            };
            for (connection_id, subscriber) in subscribers {
                if !subscriber.filter.allows(&message) {
                    continue;
                }
                match subscriber.outbox.deliver(message.clone()) {
                    Delivery::Queued => delivered += 1,
                    Delivery::Dropped => {
                        tracing::debug!(
                            session_id = %session_id,
                            connection_id = %connection_id,
                            "Outbound queue full, stats snapshot dropped"
                        );
                    }
                    Delivery::Stalled => {
                        tracing::warn!(
                            session_id = %session_id,
                            connection_id = %connection_id,
                            "Subscriber stopped reading, removing it"
                        );
                        gone.push(*connection_id);
                    }
                    Delivery::Closed => gone.push(*connection_id),
                }
            }
        }

        if !gone.is_empty() {
            let mut sessions = self.sessions.write().await;
            for connection_id in gone {
                remove_subscriber(&mut sessions, session_id, connection_id);
            }
        }

        delivered
    }

    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map_or(0, |s| s.len())
    }
}

fn remove_subscriber(
    sessions: &mut HashMap<String, HashMap<ConnectionId, Subscriber>>,
    session_id: &str,
    connection_id: ConnectionId,
) {
    if let Some(subscribers) = sessions.get_mut(session_id) {
        subscribers.remove(&connection_id);
        if subscribers.is_empty() {
            sessions.remove(session_id);
        }
    }
}
