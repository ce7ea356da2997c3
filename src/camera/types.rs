use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Ptz,
    Audio,
    Video,
    Ir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Online,
    Offline,
    Deploying,
    Ready,
}

impl CameraStatus {
    /// Whether the camera accepts new sessions and PTZ commands
    pub fn is_available(&self) -> bool {
        matches!(self, CameraStatus::Online | CameraStatus::Ready)
    }
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CameraStatus::Online => "online",
            CameraStatus::Offline => "offline",
            CameraStatus::Deploying => "deploying",
            CameraStatus::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// How the Edge Relay talks to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    /// Axis VAPIX CGI surface, HTTP digest auth
    #[default]
    Vapix,
    /// ONVIF SOAP services, WS-Security UsernameToken
    Onvif,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PtzPosition {
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
}

/// Closed interval `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Map `value` onto `[-1, 1]`
    pub fn normalize_signed(&self, value: f64) -> f64 {
        if self.span() <= 0.0 {
            return 0.0;
        }
        ((value - self.min) / self.span()) * 2.0 - 1.0
    }

    /// Map `value` onto `[0, 1]`
    pub fn normalize_unit(&self, value: f64) -> f64 {
        if self.span() <= 0.0 {
            return 0.0;
        }
        (value - self.min) / self.span()
    }

    pub fn denormalize_signed(&self, value: f64) -> f64 {
        self.min + (value + 1.0) / 2.0 * self.span()
    }

    pub fn denormalize_unit(&self, value: f64) -> f64 {
        self.min + value * self.span()
    }
}

/// Declared mechanical/optical limits of a PTZ head
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PtzLimits {
    #[serde(default = "default_pan_range")]
    pub pan: Range,
    #[serde(default = "default_tilt_range")]
    pub tilt: Range,
    #[serde(default = "default_zoom_range")]
    pub zoom: Range,
}

fn default_pan_range() -> Range {
    Range::new(-180.0, 180.0)
}

fn default_tilt_range() -> Range {
    Range::new(-90.0, 90.0)
}

fn default_zoom_range() -> Range {
    Range::new(1.0, 10.0)
}

impl Default for PtzLimits {
    fn default() -> Self {
        Self {
            pan: default_pan_range(),
            tilt: default_tilt_range(),
            zoom: default_zoom_range(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub id: String,
    /// `host:port` on the local network
    pub address: String,
    pub model: String,
    pub firmware_version: String,
    pub capabilities: BTreeSet<Capability>,
    pub status: CameraStatus,
    pub ptz_position: PtzPosition,
    pub limits: PtzLimits,
    pub family: DeviceFamily,
    pub provisioned: bool,
    pub updated_at: DateTime<Utc>,
}

impl Camera {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }
}

/// Input of `CameraRegistry::register`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraRegistration {
    #[serde(default)]
    pub id: Option<String>,
    /// Hardware identifier (MAC or serial); used to derive `id` when absent
    #[serde(default)]
    pub hardware_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub limits: Option<PtzLimits>,
    #[serde(default)]
    pub family: DeviceFamily,
}

/// Filter accepted by `CameraRegistry::list`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraFilter {
    pub status: Option<CameraStatus>,
    pub capability: Option<Capability>,
}

impl CameraFilter {
    pub fn matches(&self, camera: &Camera) -> bool {
        self.status.map_or(true, |s| camera.status == s)
            && self.capability.map_or(true, |c| camera.has_capability(c))
    }
}

/// Published by the registry whenever a camera's status changes
#[derive(Debug, Clone, PartialEq)]
pub struct CameraStatusChange {
    pub camera_id: String,
    pub previous: CameraStatus,
    pub current: CameraStatus,
}
