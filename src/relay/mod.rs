//! Edge Relay: per-call route choice between the local network and the cloud
//! relay link, plus the device-I/O adapters behind it.

pub mod call;
pub mod digest;
pub mod soap;
pub mod transport;
pub mod wsse;

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::camera::{Camera, CameraRegistry};
use crate::config::RelayConfig;
use crate::error::{Error, Result};

pub use call::{DeviceCall, DeviceInfo, DeviceResponse};
pub use transport::{
    CredentialProvider, Credentials, DeviceError, DeviceTransport, HttpDeviceTransport,
    StaticCredentials,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Local,
    Cloud,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Local => f.write_str("local"),
            Route::Cloud => f.write_str("cloud"),
        }
    }
}

pub struct EdgeRelay {
    registry: Arc<CameraRegistry>,
    transport: Arc<dyn DeviceTransport>,
    probe_timeout: Duration,
    probe_attempts: u32,
}

impl EdgeRelay {
    pub fn new(
        registry: Arc<CameraRegistry>,
        transport: Arc<dyn DeviceTransport>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            probe_timeout: config.probe_timeout(),
            probe_attempts: config.probe_attempts.max(1),
        }
    }

    /// Picks the route for the next call. Never cached.
    pub async fn resolve(&self, camera_id: &str) -> Result<Route> {
        let camera = self.registry.get(camera_id).await?;
        Ok(self.resolve_camera(&camera).await)
    }

    async fn resolve_camera(&self, camera: &Camera) -> Route {
        // Probes are read-only, so they are the one call retried on failure.
        for attempt in 1..=self.probe_attempts {
            match tokio::time::timeout(self.probe_timeout, self.transport.probe_local(camera)).await
            {
                Ok(true) => {
                    tracing::debug!(camera_id = %camera.id, attempt, "Local route available");
                    return Route::Local;
                }
                Ok(false) => {
                    tracing::debug!(camera_id = %camera.id, attempt, "Local probe refused");
                }
                Err(_) => {
                    tracing::debug!(camera_id = %camera.id, attempt, "Local probe timed out");
                }
            }
        }

        tracing::debug!(camera_id = %camera.id, "Falling back to cloud route");
        Route::Cloud
    }

    /// Resolves a route and performs the call. No retries.
    pub async fn invoke(&self, camera_id: &str, call: &DeviceCall) -> Result<DeviceResponse> {
        let camera = self.registry.get(camera_id).await?;
        let route = self.resolve_camera(&camera).await;
        self.invoke_via(route, &camera, call).await
    }

    pub async fn invoke_via(
        &self,
        route: Route,
        camera: &Camera,
        call: &DeviceCall,
    ) -> Result<DeviceResponse> {
        tracing::debug!(
            camera_id = %camera.id,
            route = %route,
            call = call.name(),
            "Invoking device call"
        );

        match self.transport.send(route, camera, call).await {
            Ok(response) => {
                self.registry.record_success(&camera.id).await;
                Ok(response)
            }
            Err(DeviceError::Unreachable(message)) => {
                tracing::warn!(
                    camera_id = %camera.id,
                    route = %route,
                    call = call.name(),
                    "Device unreachable: {}",
                    message
                );
                self.registry.record_failure(&camera.id).await;
                Err(Error::Unreachable(message))
            }
            Err(rejected @ DeviceError::Rejected { .. }) => {
                // The device answered, so it is reachable.
                self.registry.record_success(&camera.id).await;
                tracing::warn!(
                    camera_id = %camera.id,
                    call = call.name(),
                    "{}",
                    rejected
                );
                Err(rejected.into())
            }
        }
    }

    pub async fn identify(&self, camera_id: &str) -> Result<DeviceInfo> {
        let camera = self.registry.get(camera_id).await?;
        let route = self.resolve_camera(&camera).await;
        let response = self.invoke_via(route, &camera, &DeviceCall::DeviceInfo).await?;
        Ok(call::parse_device_info(camera.family, &response.body))
    }
}
