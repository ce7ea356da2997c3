//! PTZ Command Processor

pub mod processor;
pub mod types;

pub use processor::PtzProcessor;
pub use types::{
    CommandId, ContinuousMove, Direction, ExecutionStatus, PtzCommand, PtzCommandKind,
    PtzCommandPayload, PtzExecution, PtzVector,
};
