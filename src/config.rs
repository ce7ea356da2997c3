use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::camera::{CameraRegistration, CameraStatus, Capability, DeviceFamily, PtzLimits};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CodecConfig {
    pub name: String,
    pub kind: MediaKind,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
    #[serde(default)]
    pub fmtp: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SignalingConfig {
    #[serde(default = "default_codecs")]
    pub codecs: Vec<CodecConfig>,
    /// Fingerprint of the media-side DTLS certificate, `sha-256 AB:CD:...`
    #[serde(default)]
    pub dtls_fingerprint: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub cloud_url: Option<String>,
    #[serde(default)]
    pub cloud_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    pub id: String,
    pub address: String,
    pub model: String,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default = "default_capabilities")]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub family: DeviceFamily,
    #[serde(default)]
    pub limits: Option<PtzLimits>,
    pub username: String,
    pub password: String,
    #[serde(default = "default_profile_token")]
    pub profile_token: String,
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default)]
    pub initial_status: Option<CameraStatus>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_message_bytes() -> usize {
    256 * 1024
}

fn default_session_retention_secs() -> u64 {
    60
}

fn default_reap_interval_secs() -> u64 {
    15
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_probe_attempts() -> u32 {
    2
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_capabilities() -> BTreeSet<Capability> {
    [Capability::Video].into_iter().collect()
}

fn default_profile_token() -> String {
    "Profile_1".to_string()
}

fn default_codecs() -> Vec<CodecConfig> {
    vec![
        CodecConfig {
            name: "VP8".to_string(),
            kind: MediaKind::Video,
            clock_rate: 90000,
            channels: None,
            fmtp: None,
        },
        CodecConfig {
            name: "H264".to_string(),
            kind: MediaKind::Video,
            clock_rate: 90000,
            channels: None,
            fmtp: Some(
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
            ),
        },
        CodecConfig {
            name: "opus".to_string(),
            kind: MediaKind::Audio,
            clock_rate: 48000,
            channels: Some(2),
            fmtp: Some("minptime=10;useinbandfec=1".to_string()),
        },
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
            session_retention_secs: default_session_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            codecs: default_codecs(),
            dtls_fingerprint: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_attempts: default_probe_attempts(),
            failure_threshold: default_failure_threshold(),
            request_timeout_secs: default_request_timeout_secs(),
            cloud_url: None,
            cloud_token: None,
        }
    }
}

impl AppConfig {
    /// Reads the YAML file, then applies `ORCHESTRATOR__SECTION__KEY`
    /// environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.as_ref()).format(config::FileFormat::Yaml),
            )
            .add_source(
                config::Environment::with_prefix("ORCHESTRATOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration file")?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML configuration")?;
        Ok(config)
    }

    pub fn get_camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl RelayConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CameraConfig {
    pub fn to_registration(&self) -> CameraRegistration {
        CameraRegistration {
            id: Some(self.id.clone()),
            hardware_id: None,
            address: Some(self.address.clone()),
            model: Some(self.model.clone()),
            firmware_version: self.firmware_version.clone(),
            capabilities: self.capabilities.clone(),
            limits: self.limits,
            family: self.family,
        }
    }
}
