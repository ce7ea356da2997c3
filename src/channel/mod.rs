//! Control Channel: wire messages, per-session fan-out and the per-connection task

pub mod connection;
pub mod hub;
pub mod message;

pub use connection::handle_socket;
pub use hub::{ConnectionId, Delivery, EventHub, Outbox, OUTBOUND_QUEUE_CAPACITY};
pub use message::{CameraStatusEvent, ClientMessage, EventFilter, EventKind, ServerMessage};
