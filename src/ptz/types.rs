use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::camera::{PtzLimits, PtzPosition, Range};
use crate::error::{Error, Result};
use crate::relay::DeviceCall;

pub type CommandId = Uuid;

/// Speed used when a direction is given without a speed
const DEFAULT_SPEED: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtzCommandKind {
    Absolute,
    Relative,
    Continuous,
    Stop,
}

impl fmt::Display for PtzCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PtzCommandKind::Absolute => "absolute",
            PtzCommandKind::Relative => "relative",
            PtzCommandKind::Continuous => "continuous",
            PtzCommandKind::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Axis values; a missing axis keeps its current value (absolute) or
/// does not move (relative)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PtzVector {
    #[serde(default)]
    pub pan: Option<f64>,
    #[serde(default)]
    pub tilt: Option<f64>,
    #[serde(default)]
    pub zoom: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuousMove {
    #[serde(default)]
    pub pan_speed: Option<f64>,
    #[serde(default)]
    pub tilt_speed: Option<f64>,
    #[serde(default)]
    pub zoom_speed: Option<f64>,
    #[serde(default)]
    pub direction: Option<Direction>,
}

impl ContinuousMove {
    /// Signed `(pan, tilt, zoom)` speeds. A direction moves only its axis,
    /// using the magnitude of the matching speed.
    pub fn velocity(&self) -> (f64, f64, f64) {
        let magnitude = |speed: Option<f64>| speed.map(f64::abs).unwrap_or(DEFAULT_SPEED);

        match self.direction {
            None => (
                self.pan_speed.unwrap_or(0.0),
                self.tilt_speed.unwrap_or(0.0),
                self.zoom_speed.unwrap_or(0.0),
            ),
            Some(Direction::Right) => (magnitude(self.pan_speed), 0.0, 0.0),
            Some(Direction::Left) => (-magnitude(self.pan_speed), 0.0, 0.0),
            Some(Direction::Up) => (0.0, magnitude(self.tilt_speed.or(self.pan_speed)), 0.0),
            Some(Direction::Down) => (0.0, -magnitude(self.tilt_speed.or(self.pan_speed)), 0.0),
            Some(Direction::In) => (0.0, 0.0, magnitude(self.zoom_speed.or(self.pan_speed))),
            Some(Direction::Out) => (0.0, 0.0, -magnitude(self.zoom_speed.or(self.pan_speed))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PtzCommand {
    Absolute(PtzVector),
    Relative(PtzVector),
    Continuous(ContinuousMove),
    Stop,
}

/// `ptz_command` payload as it arrives on the wire
#[derive(Debug, Clone, Deserialize)]
pub struct PtzCommandPayload {
    pub command: PtzCommandKind,
    #[serde(default)]
    pub params: Value,
}

impl PtzCommand {
    pub fn kind(&self) -> PtzCommandKind {
        match self {
            PtzCommand::Absolute(_) => PtzCommandKind::Absolute,
            PtzCommand::Relative(_) => PtzCommandKind::Relative,
            PtzCommand::Continuous(_) => PtzCommandKind::Continuous,
            PtzCommand::Stop => PtzCommandKind::Stop,
        }
    }

    pub fn from_payload(payload: PtzCommandPayload) -> Result<Self> {
        let params = match payload.params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        Ok(match payload.command {
            PtzCommandKind::Absolute => PtzCommand::Absolute(serde_json::from_value(params)?),
            PtzCommandKind::Relative => PtzCommand::Relative(serde_json::from_value(params)?),
            PtzCommandKind::Continuous => PtzCommand::Continuous(serde_json::from_value(params)?),
            PtzCommandKind::Stop => PtzCommand::Stop,
        })
    }

    /// Checks the command against the camera's limits; values are never clamped.
    pub fn validate(&self, limits: &PtzLimits, current: &PtzPosition) -> Result<()> {
        match self {
            PtzCommand::Absolute(target) => {
                check_axis("pan", target.pan, &limits.pan)?;
                check_axis("tilt", target.tilt, &limits.tilt)?;
                check_axis("zoom", target.zoom, &limits.zoom)?;
            }
            PtzCommand::Relative(delta) => {
                let target = relative_target(current, delta);
                if delta.pan.is_some() {
                    check_axis("pan", Some(target.pan), &limits.pan)?;
                }
                if delta.tilt.is_some() {
                    check_axis("tilt", Some(target.tilt), &limits.tilt)?;
                }
                if delta.zoom.is_some() {
                    check_axis("zoom", Some(target.zoom), &limits.zoom)?;
                }
            }
            PtzCommand::Continuous(movement) => {
                let speed = Range::new(-1.0, 1.0);
                let (pan, tilt, zoom) = movement.velocity();
                for (name, value) in [("panSpeed", pan), ("tiltSpeed", tilt), ("zoomSpeed", zoom)] {
                    if !speed.contains(value) {
                        return Err(Error::OutOfRange(format!(
                            "{} {} outside [-1, 1]",
                            name, value
                        )));
                    }
                }
            }
            PtzCommand::Stop => {}
        }
        Ok(())
    }

    /// Device call for this command, given the position known at execution time
    pub fn to_device_call(&self, current: &PtzPosition) -> DeviceCall {
        match self {
            PtzCommand::Absolute(target) => {
                let target = absolute_target(current, target);
                DeviceCall::AbsoluteMove {
                    pan: target.pan,
                    tilt: target.tilt,
                    zoom: target.zoom,
                }
            }
            PtzCommand::Relative(delta) => DeviceCall::RelativeMove {
                pan: delta.pan.unwrap_or(0.0),
                tilt: delta.tilt.unwrap_or(0.0),
                zoom: delta.zoom.unwrap_or(0.0),
            },
            PtzCommand::Continuous(movement) => {
                let (pan_speed, tilt_speed, zoom_speed) = movement.velocity();
                DeviceCall::ContinuousMove {
                    pan_speed,
                    tilt_speed,
                    zoom_speed,
                }
            }
            PtzCommand::Stop => DeviceCall::Stop,
        }
    }

    /// Position to record once the device acknowledged the command
    pub fn acknowledged_position(&self, current: &PtzPosition) -> Option<PtzPosition> {
        match self {
            PtzCommand::Absolute(target) => Some(absolute_target(current, target)),
            PtzCommand::Relative(delta) => Some(relative_target(current, delta)),
            PtzCommand::Continuous(_) | PtzCommand::Stop => None,
        }
    }
}

fn check_axis(name: &str, value: Option<f64>, range: &Range) -> Result<()> {
    match value {
        Some(v) if !range.contains(v) => Err(Error::OutOfRange(format!(
            "{} {} outside [{}, {}]",
            name, v, range.min, range.max
        ))),
        _ => Ok(()),
    }
}

fn absolute_target(current: &PtzPosition, target: &PtzVector) -> PtzPosition {
    PtzPosition {
        pan: target.pan.unwrap_or(current.pan),
        tilt: target.tilt.unwrap_or(current.tilt),
        zoom: target.zoom.unwrap_or(current.zoom),
    }
}

fn relative_target(current: &PtzPosition, delta: &PtzVector) -> PtzPosition {
    PtzPosition {
        pan: current.pan + delta.pan.unwrap_or(0.0),
        tilt: current.tilt + delta.tilt.unwrap_or(0.0),
        zoom: current.zoom + delta.zoom.unwrap_or(0.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Cancelled,
}

/// Body of a `ptz_executed` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtzExecution {
    pub command: PtzCommandKind,
    pub status: ExecutionStatus,
    pub command_id: CommandId,
    pub camera_id: String,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<PtzPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
