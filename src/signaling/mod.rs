//! WebRTC Signaling Engine: offer/answer, ICE candidate buffering and the
//! media connection-state machine.

pub mod sdp;
pub mod types;

use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::config::SignalingConfig;
use crate::error::{Error, Result};

pub use sdp::{parse_offer, validate_candidate, SdpAnswerer};
pub use types::{
    ConnectionState, ConnectionStateChange, IceCandidate, SdpType, SessionDescription,
};

const STATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct PeerState {
    connection_state: ConnectionState,
    remote_description: Option<SessionDescription>,
    local_description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    end_of_candidates: bool,
}

pub struct SignalingEngine {
    answerer: SdpAnswerer,
    peers: RwLock<HashMap<String, PeerState>>,
    state_tx: broadcast::Sender<ConnectionStateChange>,
}

impl SignalingEngine {
    pub fn new(config: &SignalingConfig) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            answerer: SdpAnswerer::new(config),
            peers: RwLock::new(HashMap::new()),
            state_tx,
        }
    }

    /// Allocates signaling state for a session.
    pub async fn open(&self, session_id: &str) {
        let mut peers = self.peers.write().await;
        peers.entry(session_id.to_string()).or_default();
    }

    /// Answers an offer. Failures are returned to the caller, never published.
    pub async fn negotiate(
        &self,
        session_id: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::InvalidOffer(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        let parsed = parse_offer(&offer.sdp)?;
        let answer = SessionDescription::answer(self.answerer.answer(&parsed)?);

        {
            let mut peers = self.peers.write().await;
            let peer = peers
                .get_mut(session_id)
                .ok_or_else(|| Error::InvalidState(format!("session {} is closed", session_id)))?;
            peer.remote_description = Some(offer.clone());
            peer.local_description = Some(answer.clone());
        }

        let buffered = self.candidates(session_id).await.len();
        tracing::debug!(
            session_id = %session_id,
            buffered_candidates = buffered,
            "Offer answered"
        );
        self.set_connection_state(session_id, ConnectionState::Connecting)
            .await?;

        Ok(answer)
    }

    /// Buffers a remote candidate; valid before or after negotiation.
    pub async fn add_candidate(&self, session_id: &str, candidate: IceCandidate) -> Result<()> {
        validate_candidate(&candidate)?;

        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("signaling state for {}", session_id)))?;

        if candidate.is_end_of_candidates() {
            peer.end_of_candidates = true;
        } else {
            peer.candidates.push(candidate);
        }
        Ok(())
    }

    pub async fn candidates(&self, session_id: &str) -> Vec<IceCandidate> {
        let peers = self.peers.read().await;
        peers
            .get(session_id)
            .map(|p| p.candidates.clone())
            .unwrap_or_default()
    }

    pub async fn end_of_candidates(&self, session_id: &str) -> bool {
        let peers = self.peers.read().await;
        peers.get(session_id).is_some_and(|p| p.end_of_candidates)
    }

    pub async fn connection_state(&self, session_id: &str) -> Option<ConnectionState> {
        let peers = self.peers.read().await;
        peers.get(session_id).map(|p| p.connection_state)
    }

    /// Records a state reported by the media path and publishes the change.
    /// `closed` is final.
    pub async fn set_connection_state(&self, session_id: &str, state: ConnectionState) -> Result<()> {
        let change = {
            let mut peers = self.peers.write().await;
            let peer = peers
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("signaling state for {}", session_id)))?;

            let previous = peer.connection_state;
            if previous == state || previous == ConnectionState::Closed {
                return Ok(());
            }
            peer.connection_state = state;
            ConnectionStateChange {
                session_id: session_id.to_string(),
                previous,
                current: state,
            }
        };

        tracing::debug!(
            session_id = %session_id,
            previous = %change.previous,
            current = %change.current,
            "Connection state changed"
        );
        let _ = self.state_tx.send(change);
        Ok(())
    }

    /// Releases ICE/media state for the session. Idempotent.
    pub async fn close(&self, session_id: &str) {
        let removed = {
            let mut peers = self.peers.write().await;
            peers.remove(session_id)
        };

        if let Some(peer) = removed {
            if peer.connection_state != ConnectionState::Closed {
                let _ = self.state_tx.send(ConnectionStateChange {
                    session_id: session_id.to_string(),
                    previous: peer.connection_state,
                    current: ConnectionState::Closed,
                });
            }
        }
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.state_tx.subscribe()
    }
}
