use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::camera::{CameraRegistry, CameraStatus, CameraStatusChange};
use crate::channel::{CameraStatusEvent, EventHub, ServerMessage};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::ptz::{CommandId, PtzCommand, PtzProcessor};
use crate::relay::{DeviceCall, EdgeRelay};
use crate::session::types::{
    CloseReason, Session, SessionStatus, StreamAction, StreamControl, StreamParams, StreamState,
    StreamStats, StreamStatusEvent,
};
use crate::signaling::{
    ConnectionState, ConnectionStateChange, IceCandidate, SessionDescription, SignalingEngine,
};

struct SessionEntry {
    session: Session,
    /// Set to `true` when the session closes; aborts an in-flight negotiation
    cancel: watch::Sender<bool>,
}

/// Maps a media connection state onto a session transition, if any.
pub fn map_connection_state(current: SessionStatus, state: ConnectionState) -> Option<SessionStatus> {
    if current.is_terminal() {
        return None;
    }
    match state {
        ConnectionState::Failed => Some(SessionStatus::Failed),
        ConnectionState::Connected if current == SessionStatus::Negotiating => {
            Some(SessionStatus::Active)
        }
        _ => None,
    }
}

/// Owns every session and is the only writer of session state.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    registry: Arc<CameraRegistry>,
    signaling: Arc<SignalingEngine>,
    ptz: Arc<PtzProcessor>,
    relay: Arc<EdgeRelay>,
    hub: Arc<EventHub>,
    idle_timeout: Duration,
    retention: Duration,
    reap_interval: Duration,
}

impl SessionManager {
    pub fn new(
        registry: Arc<CameraRegistry>,
        signaling: Arc<SignalingEngine>,
        ptz: Arc<PtzProcessor>,
        relay: Arc<EdgeRelay>,
        hub: Arc<EventHub>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            signaling,
            ptz,
            relay,
            hub,
            idle_timeout: config.idle_timeout(),
            retention: config.session_retention(),
            reap_interval: config.reap_interval(),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub async fn create_session(&self, camera_id: &str) -> Result<Session> {
        let camera = self.registry.get(camera_id).await?;
        if !camera.status.is_available() {
            return Err(Error::CameraUnavailable(format!(
                "camera {} is {}",
                camera_id, camera.status
            )));
        }

        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), camera_id.to_string());
        let (cancel, _) = watch::channel(false);

        self.signaling.open(&id).await;
        self.sessions.write().await.insert(
            id.clone(),
            SessionEntry {
                session: session.clone(),
                cancel,
            },
        );

        tracing::info!(session_id = %id, camera_id = %camera_id, "Session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))
    }

    /// Records control-channel activity for idle accounting.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = open_entry(&mut sessions, session_id)?;
        entry.session.last_activity_at = Utc::now();
        Ok(())
    }

    /// `initializing -> negotiating -> active`, or `failed` on a bad offer.
    /// No lock is held while the signaling engine works.
    pub async fn submit_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let mut cancelled = {
            let mut sessions = self.sessions.write().await;
            let entry = open_entry(&mut sessions, session_id)?;
            if entry.session.status != SessionStatus::Initializing {
                return Err(Error::InvalidState(format!(
                    "session {} is {}, offer not accepted",
                    session_id, entry.session.status
                )));
            }
            entry.session.status = SessionStatus::Negotiating;
            entry.session.last_activity_at = Utc::now();
            entry.session.webrtc.remote_description = Some(offer.clone());
            entry.cancel.subscribe()
        };
        tracing::info!(session_id = %session_id, "Session negotiating");

        let result = tokio::select! {
            result = self.signaling.negotiate(session_id, &offer) => result,
            _ = cancelled.changed() => Err(Error::InvalidState(format!(
                "session {} closed during negotiation",
                session_id
            ))),
        };

        let mut sessions = self.sessions.write().await;
        let entry = open_entry(&mut sessions, session_id)?;

        match result {
            Ok(answer) => {
                entry.session.status = SessionStatus::Active;
                entry.session.webrtc.local_description = Some(answer.clone());
                entry.session.webrtc.connection_state = ConnectionState::Connecting;
                tracing::info!(session_id = %session_id, "Session active");
                Ok(answer)
            }
            Err(e) => {
                fail(entry, CloseReason::NegotiationFailed, StreamState::Idle);
                drop(sessions);
                tracing::warn!(session_id = %session_id, "Negotiation failed: {}", e);
                self.signaling.close(session_id).await;
                Err(e)
            }
        }
    }

    /// Valid only while negotiating or active.
    pub async fn add_ice_candidate(&self, session_id: &str, candidate: IceCandidate) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let entry = open_entry(&mut sessions, session_id)?;
            if !matches!(
                entry.session.status,
                SessionStatus::Negotiating | SessionStatus::Active
            ) {
                return Err(Error::InvalidState(format!(
                    "session {} is {}, candidates not accepted",
                    session_id, entry.session.status
                )));
            }
        }

        self.signaling
            .add_candidate(session_id, candidate.clone())
            .await?;

        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.session.webrtc.ice_candidates.push(candidate);
            entry.session.last_activity_at = Utc::now();
        }
        Ok(())
    }

    /// Valid from any state and idempotent.
    pub async fn close(&self, session_id: &str, reason: CloseReason) -> Result<()> {
        // A failed session keeps its failure reason.
        let recorded = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;

            if entry.session.status == SessionStatus::Closed {
                return Ok(());
            }

            let session = &mut entry.session;
            session.status = SessionStatus::Closed;
            session.stream_status = StreamState::Closed;
            session.closed_at.get_or_insert_with(Utc::now);
            let recorded = *session.close_reason.get_or_insert(reason);
            session.webrtc.connection_state = ConnectionState::Closed;
            let _ = entry.cancel.send(true);
            recorded
        };

        tracing::info!(session_id = %session_id, reason = %recorded, "Session closed");

        self.signaling.close(session_id).await;
        self.publish_stream_status(session_id, StreamState::Closed, Some(recorded.to_string()), None)
            .await;
        self.hub.remove_session(session_id).await;
        Ok(())
    }

    pub async fn submit_ptz(&self, session_id: &str, command: PtzCommand) -> Result<CommandId> {
        let camera_id = self.camera_of(session_id).await?;
        self.ptz
            .enqueue(&camera_id, Some(session_id), command)
            .await
    }

    /// `stop` completes inline; `start`/`update` push parameters to the
    /// device in the background and report through the session's subscribers.
    pub async fn stream_control(self: &Arc<Self>, session_id: &str, control: StreamControl) -> Result<()> {
        let camera_id = self.camera_of(session_id).await?;

        if control.action == StreamAction::Stop {
            self.set_stream_state(session_id, StreamState::Stopped).await;
            self.publish_stream_status(session_id, StreamState::Stopped, None, None)
                .await;
            return Ok(());
        }

        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let StreamParams {
                resolution,
                framerate,
            } = control.params.clone();
            let call = DeviceCall::ConfigureStream {
                resolution,
                framerate,
            };

            match manager.relay.invoke(&camera_id, &call).await {
                Ok(_) => {
                    manager
                        .set_stream_state(&session_id, StreamState::Streaming)
                        .await;
                    manager
                        .publish_stream_status(
                            &session_id,
                            StreamState::Streaming,
                            None,
                            Some(control.params),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        camera_id = %camera_id,
                        "Stream control failed: {}",
                        e
                    );
                    manager
                        .hub
                        .publish(&session_id, ServerMessage::error(&e))
                        .await;
                }
            }
        });

        Ok(())
    }

    /// Stores telemetry from the media path and fans it out.
    pub async fn publish_stats(&self, session_id: &str, stats: StreamStats) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let entry = open_entry(&mut sessions, session_id)?;
            entry.session.stats = stats;
        }
        self.hub
            .publish(session_id, ServerMessage::Stats { data: stats })
            .await;
        Ok(())
    }

    /// Republishes the latest stats snapshot to every subscriber of the session.
    pub async fn publish_current_stats(&self, session_id: &str) -> Result<()> {
        let stats = {
            let mut sessions = self.sessions.write().await;
            open_entry(&mut sessions, session_id)?.session.stats
        };
        self.hub
            .publish(session_id, ServerMessage::Stats { data: stats })
            .await;
        Ok(())
    }

    /// Feeds an ICE state observed by the media path into the signaling engine.
    pub async fn report_connection_state(&self, session_id: &str, state: ConnectionState) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            open_entry(&mut sessions, session_id)?;
        }
        self.signaling.set_connection_state(session_id, state).await
    }

    pub(crate) async fn apply_connection_change(&self, change: ConnectionStateChange) {
        let failed = {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(&change.session_id) else {
                return;
            };
            if entry.session.status.is_terminal() {
                return;
            }
            entry.session.webrtc.connection_state = change.current;

            match map_connection_state(entry.session.status, change.current) {
                Some(SessionStatus::Failed) => {
                    fail(entry, CloseReason::ConnectionFailed, StreamState::Failed);
                    true
                }
                Some(status) => {
                    entry.session.status = status;
                    false
                }
                None => false,
            }
        };

        if failed {
            tracing::warn!(session_id = %change.session_id, "Media connection failed");
            self.publish_stream_status(
                &change.session_id,
                StreamState::Failed,
                Some(CloseReason::ConnectionFailed.to_string()),
                None,
            )
            .await;
            self.signaling.close(&change.session_id).await;
        }
    }

    pub(crate) async fn handle_camera_status(&self, change: &CameraStatusChange) {
        let session_ids = self.open_sessions_for_camera(&change.camera_id).await;
        let event = CameraStatusEvent::from(change);

        for session_id in &session_ids {
            self.hub
                .publish(
                    session_id,
                    ServerMessage::CameraStatus {
                        data: event.clone(),
                    },
                )
                .await;
        }

        if change.current == CameraStatus::Offline {
            for session_id in &session_ids {
                if let Err(e) = self.close(session_id, CloseReason::CameraOffline).await {
                    tracing::debug!(session_id = %session_id, "Close after camera offline: {}", e);
                }
            }
        }
    }

    /// Closes sessions without control-channel activity for the idle timeout.
    pub async fn close_idle_sessions(&self, now: DateTime<Utc>) -> Vec<String> {
        let idle: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|e| !e.session.status.is_terminal())
                .filter(|e| {
                    now.signed_duration_since(e.session.last_activity_at)
                        .to_std()
                        .unwrap_or_default()
                        >= self.idle_timeout
                })
                .map(|e| e.session.id.clone())
                .collect()
        };

        for session_id in &idle {
            if let Err(e) = self.close(session_id, CloseReason::IdleTimeout).await {
                tracing::debug!(session_id = %session_id, "Idle close skipped: {}", e);
            }
        }
        idle
    }

    /// Drops closed/failed sessions older than the retention window.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<String> = sessions
                .values()
                .filter(|e| {
                    e.session.closed_at.is_some_and(|closed| {
                        now.signed_duration_since(closed)
                            .to_std()
                            .unwrap_or_default()
                            >= self.retention
                    })
                })
                .map(|e| e.session.id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            expired
        };

        for id in &expired {
            self.hub.remove_session(id).await;
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Purged expired sessions");
        }
        expired.len()
    }

    /// Starts the signaling-state, camera-status and reaper loops.
    pub fn spawn_watchers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let manager = Arc::clone(self);
        let mut state_changes = self.signaling.subscribe_state_changes();
        handles.push(tokio::spawn(async move {
            loop {
                match state_changes.recv().await {
                    Ok(change) => manager.apply_connection_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Connection state watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let manager = Arc::clone(self);
        let mut camera_changes = self.registry.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                match camera_changes.recv().await {
                    Ok(change) => manager.handle_camera_status(&change).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Camera status watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.reap_interval);
            loop {
                interval.tick().await;
                let now = Utc::now();
                let closed = manager.close_idle_sessions(now).await;
                if !closed.is_empty() {
                    tracing::info!(count = closed.len(), "Closed idle sessions");
                }
                manager.purge_expired(now).await;
            }
        }));

        handles
    }

    async fn camera_of(&self, session_id: &str) -> Result<String> {
        let mut sessions = self.sessions.write().await;
        let entry = open_entry(&mut sessions, session_id)?;
        Ok(entry.session.camera_id.clone())
    }

    async fn open_sessions_for_camera(&self, camera_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|e| e.session.camera_id == camera_id && !e.session.status.is_terminal())
            .map(|e| e.session.id.clone())
            .collect()
    }

    async fn set_stream_state(&self, session_id: &str, state: StreamState) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if !entry.session.status.is_terminal() {
                entry.session.stream_status = state;
            }
        }
    }

    async fn publish_stream_status(
        &self,
        session_id: &str,
        status: StreamState,
        reason: Option<String>,
        params: Option<StreamParams>,
    ) {
        let event = StreamStatusEvent {
            status,
            session_id: session_id.to_string(),
            reason,
            params,
        };
        self.hub
            .publish(session_id, ServerMessage::StreamStatus { data: event })
            .await;
    }
}

/// Entry of a session that still accepts operations.
fn open_entry<'a>(
    sessions: &'a mut HashMap<String, SessionEntry>,
    session_id: &str,
) -> Result<&'a mut SessionEntry> {
    let entry = sessions
        .get_mut(session_id)
        .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;

    match (entry.session.status, entry.session.close_reason) {
        (SessionStatus::Closed, Some(CloseReason::IdleTimeout)) => {
            Err(Error::IdleTimeout(session_id.to_string()))
        }
        (status, _) if status.is_terminal() => Err(Error::InvalidState(format!(
            "session {} is {}",
            session_id, status
        ))),
        _ => Ok(entry),
    }
}

fn fail(entry: &mut SessionEntry, reason: CloseReason, stream: StreamState) {
    let session = &mut entry.session;
    session.status = SessionStatus::Failed;
    session.stream_status = stream;
    session.closed_at = Some(Utc::now());
    session.close_reason = Some(reason);
    let _ = entry.cancel.send(true);
}
