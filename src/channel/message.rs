//! Control Channel wire messages

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::camera::{CameraStatus, CameraStatusChange};
use crate::error::{Error, Result};
use crate::ptz::{PtzCommand, PtzExecution};
use crate::session::{StreamControl, StreamStats, StreamStatusEvent};
use crate::signaling::IceCandidate;

/// Event classes a subscriber can opt into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PtzUpdate,
    StreamStats,
    CameraStatus,
}

/// Which events reach a subscriber. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    kinds: HashSet<EventKind>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_events(events: &[EventKind]) -> Self {
        Self {
            kinds: events.iter().copied().collect(),
        }
    }

    pub fn allows(&self, message: &ServerMessage) -> bool {
        match message.event_kind() {
            Some(kind) => self.kinds.is_empty() || self.kinds.contains(&kind),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe {
        session_id: String,
        events: Vec<EventKind>,
    },
    PtzCommand(PtzCommand),
    StreamControl(StreamControl),
    GetStats,
    Ping,
    Offer {
        sdp: String,
    },
    IceCandidate(IceCandidate),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribePayload {
    session_id: String,
    #[serde(default)]
    events: Vec<EventKind>,
}

#[derive(Debug, Deserialize)]
struct OfferPayload {
    sdp: String,
}

impl ClientMessage {
    /// Two-phase parse: the envelope first, then the payload for its type.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;
        let payload = match raw.payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        let message = match raw.kind.as_str() {
            "subscribe" => {
                let p: SubscribePayload = serde_json::from_value(payload)?;
                ClientMessage::Subscribe {
                    session_id: p.session_id,
                    events: p.events,
                }
            }
            "ptz_command" => {
                ClientMessage::PtzCommand(PtzCommand::from_payload(serde_json::from_value(payload)?)?)
            }
            "stream_control" => ClientMessage::StreamControl(serde_json::from_value(payload)?),
            "get_stats" => ClientMessage::GetStats,
            "ping" => ClientMessage::Ping,
            "offer" => {
                let p: OfferPayload = serde_json::from_value(payload)?;
                ClientMessage::Offer { sdp: p.sdp }
            }
            "ice_candidate" => ClientMessage::IceCandidate(serde_json::from_value(payload)?),
            other => {
                return Err(Error::Unsupported(format!("message type '{}'", other)));
            }
        };

        Ok(message)
    }
}

/// Body of a `camera_status` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatusEvent {
    pub camera_id: String,
    pub status: CameraStatus,
    pub previous: CameraStatus,
}

impl From<&CameraStatusChange> for CameraStatusEvent {
    fn from(change: &CameraStatusChange) -> Self {
        Self {
            camera_id: change.camera_id.clone(),
            status: change.current,
            previous: change.previous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Answer {
        #[serde(rename = "sessionId")]
        session_id: String,
        sdp: String,
    },
    PtzExecuted {
        data: PtzExecution,
    },
    StreamStatus {
        data: StreamStatusEvent,
    },
    Stats {
        data: StreamStats,
    },
    CameraStatus {
        data: CameraStatusEvent,
    },
    Pong,
    Error {
        message: String,
        code: String,
    },
}

impl ServerMessage {
    pub fn error(err: &Error) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            code: err.error_code().to_string(),
        }
    }

    /// Filterable class; `None` for messages every subscriber receives
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            ServerMessage::PtzExecuted { .. } => Some(EventKind::PtzUpdate),
            ServerMessage::StreamStatus { .. } | ServerMessage::Stats { .. } => {
                Some(EventKind::StreamStats)
            }
            ServerMessage::CameraStatus { .. } => Some(EventKind::CameraStatus),
            _ => None,
        }
    }

    /// Periodic snapshots a slow reader can miss without losing state.
    pub fn is_droppable(&self) -> bool {
        matches!(self, ServerMessage::Stats { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptz::PtzVector;
    use crate::session::{StreamAction, StreamParams, StreamState};

    #[test]
    fn test_parse_subscribe() {
        let message = ClientMessage::parse(
            r#"{"type":"subscribe","payload":{"sessionId":"s-1","events":["ptz_update","camera_status"]}}"#,
        )
        .unwrap();

        assert_eq!(
            message,
            ClientMessage::Subscribe {
                session_id: "s-1".to_string(),
                events: vec![EventKind::PtzUpdate, EventKind::CameraStatus],
            }
        );
    }

    #[test]
    fn test_parse_ptz_and_stream_control() {
        let ptz = ClientMessage::parse(
            r#"{"type":"ptz_command","payload":{"command":"absolute","params":{"pan":45,"tilt":30,"zoom":1.8}}}"#,
        )
        .unwrap();
        assert_eq!(
            ptz,
            ClientMessage::PtzCommand(PtzCommand::Absolute(PtzVector {
                pan: Some(45.0),
                tilt: Some(30.0),
                zoom: Some(1.8),
            }))
        );

        let control = ClientMessage::parse(
            r#"{"type":"stream_control","payload":{"action":"start","params":{"resolution":"1920x1080","framerate":30}}}"#,
        )
        .unwrap();
        assert_eq!(
            control,
            ClientMessage::StreamControl(StreamControl {
                action: StreamAction::Start,
                params: StreamParams {
                    resolution: Some("1920x1080".to_string()),
                    framerate: Some(30),
                },
            })
        );
    }

    #[test]
    fn test_parse_payloadless_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"get_stats"}"#).unwrap(),
            ClientMessage::GetStats
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ClientMessage::parse("{not json"),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"reboot"}"#),
            Err(Error::Unsupported(_))
        ));
        assert!(ClientMessage::parse(r#"{"type":"subscribe","payload":{}}"#).is_err());
    }

    #[test]
    fn test_outbound_shapes() {
        let connected = ServerMessage::Connected {
            session_id: "s-1".to_string(),
        };
        assert_eq!(
            connected.to_json().unwrap(),
            r#"{"type":"connected","sessionId":"s-1"}"#
        );

        let status = ServerMessage::StreamStatus {
            data: StreamStatusEvent {
                status: StreamState::Streaming,
                session_id: "s-1".to_string(),
                reason: None,
                params: None,
            },
        };
        assert_eq!(
            status.to_json().unwrap(),
            r#"{"type":"stream_status","data":{"status":"streaming","sessionId":"s-1"}}"#
        );

        assert_eq!(ServerMessage::Pong.to_json().unwrap(), r#"{"type":"pong"}"#);

        let error = ServerMessage::error(&Error::OutOfRange("pan 999".to_string()));
        let value: Value = serde_json::from_str(&error.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "OUT_OF_RANGE");
    }

    #[test]
    fn test_filter() {
        let filter = EventFilter::from_events(&[EventKind::CameraStatus]);
        assert!(!filter.allows(&ServerMessage::Stats {
            data: StreamStats::default()
        }));
        assert!(filter.allows(&ServerMessage::Pong));
        assert!(EventFilter::all().allows(&ServerMessage::Stats {
            data: StreamStats::default()
        }));
    }
}
