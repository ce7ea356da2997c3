//! Viewer sessions: lifecycle, idle reaping and event fan-out triggers.

pub mod manager;
pub mod types;

pub use manager::{map_connection_state, SessionManager};
pub use types::{
    CloseReason, Session, SessionStatus, StreamAction, StreamControl, StreamParams, StreamState,
    StreamStats, StreamStatusEvent, WebRtcState,
};
