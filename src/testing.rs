//! Test doubles shared by unit tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::camera::{Camera, CameraRegistration, CameraRegistry, CameraStatus, Capability};
use crate::relay::{DeviceCall, DeviceError, DeviceResponse, DeviceTransport, Route};

#[derive(Default)]
struct Script {
    locally_unreachable: HashSet<String>,
    probe_delay: Option<Duration>,
    failing: HashMap<String, DeviceError>,
    fail_next: HashMap<String, VecDeque<DeviceError>>,
    delays: HashMap<String, VecDeque<Duration>>,
    responses: HashMap<(String, String), String>,
    calls: Vec<(String, Route, DeviceCall)>,
}

/// Device transport with scripted latency, failures and replies
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn set_locally_unreachable(&self, camera_id: &str, unreachable: bool) {
        let mut script = self.script.lock().unwrap();
        if unreachable {
            script.locally_unreachable.insert(camera_id.to_string());
        } else {
            script.locally_unreachable.remove(camera_id);
        }
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.script.lock().unwrap().probe_delay = Some(delay);
    }

    pub fn fail_always(&self, camera_id: &str, error: DeviceError) {
        self.script
            .lock()
            .unwrap()
            .failing
            .insert(camera_id.to_string(), error);
    }

    pub fn fail_next(&self, camera_id: &str, error: DeviceError) {
        self.script
            .lock()
            .unwrap()
            .fail_next
            .entry(camera_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn delay_next(&self, camera_id: &str, delay: Duration) {
        self.script
            .lock()
            .unwrap()
            .delays
            .entry(camera_id.to_string())
            .or_default()
            .push_back(delay);
    }

    pub fn respond(&self, camera_id: &str, call_name: &str, body: &str) {
        self.script.lock().unwrap().responses.insert(
            (camera_id.to_string(), call_name.to_string()),
            body.to_string(),
        );
    }

    pub fn calls(&self) -> Vec<(String, Route, DeviceCall)> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, camera_id: &str) -> Vec<DeviceCall> {
        self.calls()
            .into_iter()
            .filter(|(id, _, _)| id == camera_id)
            .map(|(_, _, call)| call)
            .collect()
    }
}

#[async_trait]
impl DeviceTransport for ScriptedTransport {
    async fn probe_local(&self, camera: &Camera) -> bool {
        let (delay, reachable) = {
            let script = self.script.lock().unwrap();
            (
                script.probe_delay,
                !script.locally_unreachable.contains(&camera.id),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reachable
    }

    async fn send(
        &self,
        route: Route,
        camera: &Camera,
        call: &DeviceCall,
    ) -> Result<DeviceResponse, DeviceError> {
        let (delay, outcome) = {
            let mut script = self.script.lock().unwrap();
            script
                .calls
                .push((camera.id.clone(), route, call.clone()));

            let delay = script
                .delays
                .get_mut(&camera.id)
                .and_then(VecDeque::pop_front);
            let next_failure = script
                .fail_next
                .get_mut(&camera.id)
                .and_then(VecDeque::pop_front);
            let outcome = match next_failure.or_else(|| script.failing.get(&camera.id).cloned()) {
                Some(error) => Err(error),
                None => Ok(DeviceResponse {
                    status: 200,
                    body: script
                        .responses
                        .get(&(camera.id.clone(), call.name().to_string()))
                        .cloned()
                        .unwrap_or_default(),
                }),
            };
            (delay, outcome)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

pub fn registration(camera_id: &str, capabilities: &[Capability]) -> CameraRegistration {
    CameraRegistration {
        id: Some(camera_id.to_string()),
        address: Some("192.168.1.20:80".to_string()),
        model: Some("AXIS Q6135-LE".to_string()),
        capabilities: capabilities.iter().copied().collect(),
        ..Default::default()
    }
}

/// Registers, provisions and marks a camera online
pub async fn online_camera(registry: &CameraRegistry, camera_id: &str, capabilities: &[Capability]) {
    registry
        .register(registration(camera_id, capabilities))
        .await
        .unwrap();
    registry.confirm_provisioned(camera_id).await.unwrap();
    registry
        .mark_status(camera_id, CameraStatus::Online)
        .await
        .unwrap();
}
