use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::camera::Camera;
use crate::config::{CameraConfig, RelayConfig};
use crate::error::Error;
use crate::relay::call::{self, DeviceCall, DeviceRequest, DeviceResponse, RequestMethod};
use crate::relay::digest::DigestChallenge;
use crate::relay::soap;
use crate::relay::wsse::UsernameToken;
use crate::relay::Route;

const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub profile_token: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            profile_token: "Profile_1".to_string(),
        }
    }
}

/// Supplies device credentials; the provisioning side owns them.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, camera_id: &str) -> Option<Credentials>;
}

/// Credentials read from the camera seed list
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_camera: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn from_config(cameras: &[CameraConfig]) -> Self {
        let by_camera = cameras
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    Credentials {
                        username: c.username.clone(),
                        password: c.password.clone(),
                        profile_token: c.profile_token.clone(),
                    },
                )
            })
            .collect();
        Self { by_camera }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, camera_id: &str) -> Option<Credentials> {
        self.by_camera.get(camera_id).cloned()
    }
}

/// Outcome classes of a device call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    /// Nothing answered: refused, timed out, relay gateway error
    #[error("{0}")]
    Unreachable(String),

    /// The device answered and refused
    #[error("device rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Unreachable(message) => Error::Unreachable(message),
            DeviceError::Rejected { status, message } => Error::DeviceRejected { status, message },
        }
    }
}

/// Device-facing I/O. Orchestration code never sees authentication or wire formats.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Direct reachability check against the camera's local address
    async fn probe_local(&self, camera: &Camera) -> bool;

    async fn send(
        &self,
        route: Route,
        camera: &Camera,
        call: &DeviceCall,
    ) -> Result<DeviceResponse, DeviceError>;
}

/// Reply body of the cloud relay's invoke endpoint
#[derive(Debug, Deserialize)]
struct RelayedResponse {
    status: u16,
    #[serde(default)]
    body: String,
}

pub struct HttpDeviceTransport {
    http_client: Client,
    credentials: Arc<dyn CredentialProvider>,
    cloud_url: Option<String>,
    cloud_token: Option<String>,
}

impl HttpDeviceTransport {
    pub fn new(
        config: &RelayConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> crate::error::Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            credentials,
            cloud_url: config.cloud_url.clone(),
            cloud_token: config.cloud_token.clone(),
        })
    }

    fn credentials_for(&self, camera: &Camera) -> Credentials {
        self.credentials.credentials(&camera.id).unwrap_or_else(|| {
            tracing::warn!(camera_id = %camera.id, "No credentials for camera, sending anonymously");
            Credentials::default()
        })
    }

    async fn send_local(
        &self,
        camera: &Camera,
        call: &DeviceCall,
    ) -> Result<DeviceResponse, DeviceError> {
        let credentials = self.credentials_for(camera);
        let request = call::render(call, camera, &credentials.profile_token);
        let url = device_url(camera, &request)?;

        match request.method {
            RequestMethod::Get => self.send_cgi(url, &request, &credentials).await,
            RequestMethod::Post => self.send_soap(url, &request, &credentials).await,
        }
    }

    /// One anonymous attempt, then a single authenticated retry on `401`.
    async fn send_cgi(
        &self,
        url: Url,
        request: &DeviceRequest,
        credentials: &Credentials,
    ) -> Result<DeviceResponse, DeviceError> {
        tracing::trace!("Sending CGI request to {}", url);

        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(unreachable)?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return read_response(request, response).await;
        }

        let challenges: Vec<String> = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();

        let retry = if let Some(challenge) = challenges.iter().find_map(|c| DigestChallenge::parse(c))
        {
            let uri = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            let cnonce = Uuid::new_v4().simple().to_string();
            let authorization = challenge.authorization(
                &credentials.username,
                &credentials.password,
                "GET",
                &uri,
                &cnonce,
                1,
            );
            let value = HeaderValue::from_str(&authorization).map_err(|e| {
                DeviceError::Rejected {
                    status: 401,
                    message: format!("unusable digest credentials: {}", e),
                }
            })?;
            self.http_client.get(url).header(AUTHORIZATION, value)
        } else if challenges
            .iter()
            .any(|c| c.trim_start().to_ascii_lowercase().starts_with("basic"))
        {
            self.http_client
                .get(url)
                .basic_auth(&credentials.username, Some(&credentials.password))
        } else {
            return Err(DeviceError::Rejected {
                status: 401,
                message: "unsupported authentication challenge".to_string(),
            });
        };

        let response = retry.send().await.map_err(unreachable)?;
        read_response(request, response).await
    }

    async fn send_soap(
        &self,
        url: Url,
        request: &DeviceRequest,
        credentials: &Credentials,
    ) -> Result<DeviceResponse, DeviceError> {
        let security_header =
            UsernameToken::sign(&credentials.username, &credentials.password).to_header();
        let envelope = soap::envelope(
            request.body.as_deref().unwrap_or_default(),
            Some(&security_header),
        );

        tracing::trace!("Sending SOAP request to {}", url);

        let response = self
            .http_client
            .post(url)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await
            .map_err(unreachable)?;

        read_response(request, response).await
    }

    async fn send_cloud(
        &self,
        camera: &Camera,
        call: &DeviceCall,
    ) -> Result<DeviceResponse, DeviceError> {
        let base = self
            .cloud_url
            .as_deref()
            .ok_or_else(|| DeviceError::Unreachable("no cloud relay configured".to_string()))?;

        let credentials = self.credentials_for(camera);
        let request = call::render(call, camera, &credentials.profile_token);
        let url = format!("{}/cameras/{}/invoke", base.trim_end_matches('/'), camera.id);

        tracing::trace!("Forwarding {} for {} through cloud relay", call.name(), camera.id);

        let mut builder = self.http_client.post(&url).json(&request);
        if let Some(token) = &self.cloud_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(unreachable)?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(DeviceError::Unreachable(format!(
                "cloud relay could not reach camera ({})",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceError::Rejected {
                status: status.as_u16(),
                message: first_line(&body, status.as_u16()),
            });
        }

        let relayed: RelayedResponse = response
            .json()
            .await
            .map_err(|e| DeviceError::Unreachable(format!("malformed relay response: {}", e)))?;

        classify(&request, relayed.status, relayed.body)
    }
}

#[async_trait]
impl DeviceTransport for HttpDeviceTransport {
    async fn probe_local(&self, camera: &Camera) -> bool {
        tokio::net::TcpStream::connect(camera.address.as_str())
            .await
            .is_ok()
    }

    async fn send(
        &self,
        route: Route,
        camera: &Camera,
        call: &DeviceCall,
    ) -> Result<DeviceResponse, DeviceError> {
        match route {
            Route::Local => self.send_local(camera, call).await,
            Route::Cloud => self.send_cloud(camera, call).await,
        }
    }
}

fn device_url(camera: &Camera, request: &DeviceRequest) -> Result<Url, DeviceError> {
    let base = format!("{}{}", camera.base_url(), request.path);
    let url = if request.query.is_empty() {
        Url::parse(&base)
    } else {
        Url::parse_with_params(&base, &request.query)
    };
    url.map_err(|e| {
        DeviceError::Unreachable(format!("invalid device address {}: {}", camera.address, e))
    })
}

fn unreachable(err: reqwest::Error) -> DeviceError {
    DeviceError::Unreachable(err.to_string())
}

async fn read_response(
    request: &DeviceRequest,
    response: reqwest::Response,
) -> Result<DeviceResponse, DeviceError> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(unreachable)?;
    classify(request, status, body)
}

/// Sorts a device answer into success or rejection.
fn classify(request: &DeviceRequest, status: u16, body: String) -> Result<DeviceResponse, DeviceError> {
    if request.body.is_some() {
        if let Some(reason) = soap::find_fault(&body) {
            return Err(DeviceError::Rejected {
                status,
                message: reason,
            });
        }
    }

    if !(200..300).contains(&status) {
        return Err(DeviceError::Rejected {
            status,
            message: first_line(&body, status),
        });
    }

    // VAPIX reports CGI errors in a 200 body.
    let trimmed = body.trim_start();
    if request.method == RequestMethod::Get
        && (trimmed.starts_with("# Error") || trimmed.starts_with("Error"))
    {
        return Err(DeviceError::Rejected {
            status,
            message: first_line(trimmed, status),
        });
    }

    Ok(DeviceResponse { status, body })
}

fn first_line(body: &str, status: u16) -> String {
    body.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(200).collect())
        .unwrap_or_else(|| format!("HTTP {}", status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraStatus, DeviceFamily, PtzLimits, PtzPosition};
    use axum::{http::HeaderMap, response::IntoResponse, routing::get, Router};
    use chrono::Utc;

    fn camera(address: String) -> Camera {
        Camera {
            id: "cam-1".to_string(),
            address,
            model: "AXIS Q6135-LE".to_string(),
            firmware_version: String::new(),
            capabilities: Default::default(),
            status: CameraStatus::Online,
            ptz_position: PtzPosition::default(),
            limits: PtzLimits::default(),
            family: DeviceFamily::Vapix,
            provisioned: true,
            updated_at: Utc::now(),
        }
    }

    struct FixedCredentials;

    impl CredentialProvider for FixedCredentials {
        fn credentials(&self, _camera_id: &str) -> Option<Credentials> {
            Some(Credentials {
                username: "root".to_string(),
                password: "pass".to_string(),
                profile_token: "Profile_1".to_string(),
            })
        }
    }

    fn transport(cloud_url: Option<String>) -> HttpDeviceTransport {
        let config = RelayConfig {
            cloud_url,
            ..Default::default()
        };
        HttpDeviceTransport::new(&config, Arc::new(FixedCredentials)).unwrap()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[test]
    fn test_classify_soap_fault_as_rejected() {
        let request = DeviceRequest {
            method: RequestMethod::Post,
            path: "/onvif/ptz_service".to_string(),
            query: Vec::new(),
            body: Some("<tptz:Stop/>".to_string()),
        };
        let fault = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Reason><s:Text>Not Authorized</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;

        let result = classify(&request, 400, fault.to_string());
        assert_eq!(
            result,
            Err(DeviceError::Rejected {
                status: 400,
                message: "Not Authorized".to_string()
            })
        );
    }

    #[test]
    fn test_classify_vapix_error_body() {
        let request = DeviceRequest {
            method: RequestMethod::Get,
            path: "/axis-cgi/param.cgi".to_string(),
            query: Vec::new(),
            body: None,
        };
        let result = classify(&request, 200, "# Error: Error setting 'Image.I0.Stream.FPS'".to_string());
        assert!(matches!(result, Err(DeviceError::Rejected { status: 200, .. })));

        let ok = classify(&request, 204, String::new()).unwrap();
        assert_eq!(ok.status, 204);
    }

    #[test]
    fn test_static_credentials_from_config() {
        let config = crate::config::AppConfig::from_yaml_str(
            r#"
cameras:
  - id: cam-1
    address: "10.0.0.2:80"
    model: "M5525-E"
    username: root
    password: secret
"#,
        )
        .unwrap();

        let provider = StaticCredentials::from_config(&config.cameras);
        let credentials = provider.credentials("cam-1").unwrap();
        assert_eq!(credentials.username, "root");
        assert_eq!(credentials.profile_token, "Profile_1");
        assert!(provider.credentials("cam-2").is_none());
    }

    #[tokio::test]
    async fn test_digest_retry_after_challenge() {
        async fn ptz(headers: HeaderMap) -> axum::response::Response {
            match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                Some(auth) if auth.starts_with(r#"Digest username="root""#) => {
                    "pan=12.5\ntilt=-3\nzoom=1\n".into_response()
                }
                _ => (
                    axum::http::StatusCode::UNAUTHORIZED,
                    [(
                        "www-authenticate",
                        r#"Digest realm="AXIS_ACCC8E000000", nonce="abc123", qop="auth""#,
                    )],
                )
                    .into_response(),
            }
        }

        let address = serve(Router::new().route("/axis-cgi/com/ptz.cgi", get(ptz))).await;
        let transport = transport(None);

        let response = transport
            .send(Route::Local, &camera(address), &DeviceCall::QueryPosition)
            .await
            .unwrap();
        assert!(response.body.starts_with("pan=12.5"));
    }

    #[tokio::test]
    async fn test_wrong_credentials_are_rejected_not_unreachable() {
        async fn always_unauthorized() -> axum::response::Response {
            (
                axum::http::StatusCode::UNAUTHORIZED,
                [("www-authenticate", r#"Digest realm="AXIS", nonce="n1""#)],
                "Unauthorized",
            )
                .into_response()
        }

        let address =
            serve(Router::new().route("/axis-cgi/com/ptz.cgi", get(always_unauthorized))).await;
        let result = transport(None)
            .send(Route::Local, &camera(address), &DeviceCall::Stop)
            .await;

        assert!(matches!(result, Err(DeviceError::Rejected { status: 401, .. })));
    }

    #[tokio::test]
    async fn test_cloud_route_without_relay_is_unreachable() {
        let result = transport(None)
            .send(
                Route::Cloud,
                &camera("10.255.255.1:80".to_string()),
                &DeviceCall::Stop,
            )
            .await;
        assert!(matches!(result, Err(DeviceError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_cloud_gateway_error_is_unreachable() {
        async fn gateway_timeout() -> axum::http::StatusCode {
            axum::http::StatusCode::GATEWAY_TIMEOUT
        }

        let address = serve(Router::new().route(
            "/cameras/:id/invoke",
            axum::routing::post(gateway_timeout),
        ))
        .await;
        let result = transport(Some(format!("http://{}", address)))
            .send(
                Route::Cloud,
                &camera("10.255.255.1:80".to_string()),
                &DeviceCall::QueryPosition,
            )
            .await;
        assert!(matches!(result, Err(DeviceError::Unreachable(_))));
    }
}
