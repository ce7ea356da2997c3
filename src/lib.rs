//! Camera session orchestration: viewer sessions, WebRTC signaling, PTZ
//! command queues and the WebSocket control channel in front of them.

pub mod camera;
pub mod channel;
pub mod config;
pub mod error;
pub mod ptz;
pub mod relay;
pub mod server;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
