pub mod registry;
pub mod types;

pub use registry::CameraRegistry;
pub use types::{
    Camera, CameraFilter, CameraRegistration, CameraStatus, CameraStatusChange, Capability,
    DeviceFamily, PtzLimits, PtzPosition, Range,
};
