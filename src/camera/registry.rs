use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::camera::types::{
    Camera, CameraFilter, CameraRegistration, CameraStatus, CameraStatusChange, PtzPosition,
};
use crate::error::{Error, Result};

const STATUS_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

struct CameraRecord {
    camera: Camera,
    consecutive_failures: u32,
}

/// Single owner of camera records.
///
/// `status` is written only here (registration, probes, relay failure
/// accounting); `ptz_position` only through [`CameraRegistry::set_ptz_position`],
/// which is reserved for the PTZ processor.
pub struct CameraRegistry {
    cameras: Arc<RwLock<HashMap<String, CameraRecord>>>,
    status_tx: broadcast::Sender<CameraStatusChange>,
    failure_threshold: u32,
}

impl CameraRegistry {
    /// `failure_threshold` consecutive unreachable results mark a camera offline.
    pub fn new(failure_threshold: u32) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            cameras: Arc::new(RwLock::new(HashMap::new())),
            status_tx,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Idempotent upsert keyed by hardware id.
    ///
    /// Existing records keep their status, position and provisioning state.
    pub async fn register(&self, registration: CameraRegistration) -> Result<String> {
        let id = derive_camera_id(&registration)?;

        let address = registration
            .address
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| Error::InvalidCamera(format!("camera {} has no address", id)))?;
        let model = registration
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::InvalidCamera(format!("camera {} has no model", id)))?;

        let mut cameras = self.cameras.write().await;
        match cameras.get_mut(&id) {
            Some(record) => {
                let camera = &mut record.camera;
                camera.address = address;
                camera.model = model;
                if let Some(fw) = registration.firmware_version {
                    camera.firmware_version = fw;
                }
                if !registration.capabilities.is_empty() {
                    camera.capabilities = registration.capabilities;
                }
                if let Some(limits) = registration.limits {
                    camera.limits = limits;
                }
                camera.family = registration.family;
                camera.updated_at = Utc::now();
                tracing::debug!(camera_id = %id, "Updated camera registration");
            }
            None => {
                let limits = registration.limits.unwrap_or_default();
                let camera = Camera {
                    id: id.clone(),
                    address,
                    model,
                    firmware_version: registration.firmware_version.unwrap_or_default(),
                    capabilities: registration.capabilities,
                    status: CameraStatus::Deploying,
                    ptz_position: PtzPosition {
                        pan: 0.0,
                        tilt: 0.0,
                        zoom: limits.zoom.min,
                    },
                    limits,
                    family: registration.family,
                    provisioned: false,
                    updated_at: Utc::now(),
                };
                cameras.insert(
                    id.clone(),
                    CameraRecord {
                        camera,
                        consecutive_failures: 0,
                    },
                );
                tracing::info!(camera_id = %id, "Registered camera");
            }
        }

        Ok(id)
    }

    pub async fn get(&self, camera_id: &str) -> Result<Camera> {
        let cameras = self.cameras.read().await;
        cameras
            .get(camera_id)
            .map(|r| r.camera.clone())
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))
    }

    pub async fn list(&self, filter: &CameraFilter) -> Vec<Camera> {
        let cameras = self.cameras.read().await;
        let mut result: Vec<Camera> = cameras
            .values()
            .map(|r| &r.camera)
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Called by the Device Provisioning collaborator once the on-device
    /// application is confirmed running.
    pub async fn confirm_provisioned(&self, camera_id: &str) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        let record = cameras
            .get_mut(camera_id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;
        record.camera.provisioned = true;
        record.camera.updated_at = Utc::now();
        tracing::info!(camera_id = %camera_id, "Camera provisioning confirmed");
        Ok(())
    }

    /// Setter used by the external reachability prober.
    pub async fn mark_status(&self, camera_id: &str, status: CameraStatus) -> Result<()> {
        let change = {
            let mut cameras = self.cameras.write().await;
            let record = cameras
                .get_mut(camera_id)
                .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

            if status.is_available() && !record.camera.provisioned {
                return Err(Error::InvalidState(format!(
                    "camera {} is not provisioned",
                    camera_id
                )));
            }
            if status.is_available() {
                record.consecutive_failures = 0;
            }
            Self::apply_status(record, status)
        };

        if let Some(change) = change {
            self.publish(change);
        }
        Ok(())
    }

    /// Counts a definitive device-call failure. Returns the new status when
    /// the threshold demoted the camera.
    pub async fn record_failure(&self, camera_id: &str) -> Option<CameraStatus> {
        let change = {
            let mut cameras = self.cameras.write().await;
            let record = cameras.get_mut(camera_id)?;
            record.consecutive_failures += 1;

            tracing::debug!(
                camera_id = %camera_id,
                failures = record.consecutive_failures,
                "Device call failed"
            );

            if record.consecutive_failures >= self.failure_threshold
                && record.camera.status.is_available()
            {
                Self::apply_status(record, CameraStatus::Offline)
            } else {
                None
            }
        };

        change.map(|c| {
            tracing::warn!(
                camera_id = %camera_id,
                threshold = self.failure_threshold,
                "Camera demoted to offline after consecutive failures"
            );
            let current = c.current;
            self.publish(c);
            current
        })
    }

    pub async fn record_success(&self, camera_id: &str) {
        let mut cameras = self.cameras.write().await;
        if let Some(record) = cameras.get_mut(camera_id) {
            record.consecutive_failures = 0;
        }
    }

    /// Only the PTZ processor calls this, after a positive device acknowledgment.
    pub(crate) async fn set_ptz_position(&self, camera_id: &str, position: PtzPosition) {
        let mut cameras = self.cameras.write().await;
        if let Some(record) = cameras.get_mut(camera_id) {
            record.camera.ptz_position = position;
            record.camera.updated_at = Utc::now();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CameraStatusChange> {
        self.status_tx.subscribe()
    }

    fn apply_status(record: &mut CameraRecord, status: CameraStatus) -> Option<CameraStatusChange> {
        let previous = record.camera.status;
        if previous == status {
            return None;
        }
        record.camera.status = status;
        record.camera.updated_at = Utc::now();
        Some(CameraStatusChange {
            camera_id: record.camera.id.clone(),
            previous,
            current: status,
        })
    }

    fn publish(&self, change: CameraStatusChange) {
        tracing::info!(
            camera_id = %change.camera_id,
            previous = %change.previous,
            current = %change.current,
            "Camera status changed"
        );
        // No receivers is fine: nobody is watching yet.
        let _ = self.status_tx.send(change);
    }
}

impl Default for CameraRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

fn derive_camera_id(registration: &CameraRegistration) -> Result<String> {
    if let Some(id) = registration.id.as_deref().map(str::trim) {
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    let hardware_id = registration
        .hardware_id
        .as_deref()
        .map(|h| {
            h.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidCamera("neither id nor hardware id given".to_string()))?;

    Ok(format!("cam-{}", hardware_id))
}
