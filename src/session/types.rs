use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::signaling::{ConnectionState, IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Negotiating,
    Active,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Negotiating => "negotiating",
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientClosed,
    IdleTimeout,
    CameraOffline,
    NegotiationFailed,
    ConnectionFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::CameraOffline => "camera_offline",
            CloseReason::NegotiationFailed => "negotiation_failed",
            CloseReason::ConnectionFailed => "connection_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcState {
    pub connection_state: ConnectionState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub ice_candidates: Vec<IceCandidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Stopped,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Start,
    Stop,
    Update,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,
}

/// `stream_control` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamControl {
    pub action: StreamAction,
    #[serde(default)]
    pub params: StreamParams,
}

/// Body of a `stream_status` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusEvent {
    pub status: StreamState,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<StreamParams>,
}

/// Receive-side counters reported by the media path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    #[serde(default)]
    pub packets_received: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub frames_received: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub camera_id: String,
    pub status: SessionStatus,
    pub webrtc: WebRtcState,
    pub stream_status: StreamState,
    pub stats: StreamStats,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

impl Session {
    pub fn new(id: String, camera_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            camera_id,
            status: SessionStatus::Initializing,
            webrtc: WebRtcState::default(),
            stream_status: StreamState::Idle,
            stats: StreamStats::default(),
            created_at: now,
            last_activity_at: now,
            closed_at: None,
            close_reason: None,
        }
    }
}
