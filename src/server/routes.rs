use axum::{
    async_trait,
    extract::{ws::WebSocketUpgrade, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::camera::{Camera, CameraFilter, CameraRegistration, CameraRegistry, CameraStatus};
use crate::channel;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::ptz::PtzProcessor;
use crate::relay::{DeviceInfo, DeviceTransport, EdgeRelay};
use crate::session::{CloseReason, Session, SessionManager, StreamStats};
use crate::signaling::{ConnectionState, IceCandidate, SessionDescription, SignalingEngine};

/// Header carrying the principal validated by the upstream auth service
pub const PRINCIPAL_HEADER: &str = "x-authenticated-principal";

/// Hard cap on a single WebSocket frame, as a multiple of the configured
/// message limit. Frames between the two get an `error` reply; frames above
/// the cap close the connection with 1009.
const FRAME_LIMIT_FACTOR: usize = 4;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CameraRegistry>,
    pub relay: Arc<EdgeRelay>,
    pub sessions: Arc<SessionManager>,
    pub max_message_bytes: usize,
}

impl AppState {
    /// Wires every component once and seeds the registry from `config.cameras`.
    pub async fn build(config: &AppConfig, transport: Arc<dyn DeviceTransport>) -> Result<Self> {
        let registry = Arc::new(CameraRegistry::new(config.relay.failure_threshold));
        let relay = Arc::new(EdgeRelay::new(registry.clone(), transport, &config.relay));
        let hub = Arc::new(channel::EventHub::new());
        let ptz = Arc::new(PtzProcessor::new(registry.clone(), relay.clone(), hub.clone()));
        let signaling = Arc::new(SignalingEngine::new(&config.signaling));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            signaling,
            ptz,
            relay.clone(),
            hub,
            &config.server,
        ));

        for camera in &config.cameras {
            let id = registry.register(camera.to_registration()).await?;
            if camera.provisioned {
                registry.confirm_provisioned(&id).await?;
            }
            if let Some(status) = camera.initial_status {
                registry.mark_status(&id, status).await?;
            }
        }

        Ok(Self {
            registry,
            relay,
            sessions,
            max_message_bytes: config.server.max_message_bytes,
        })
    }
}

/// Principal forwarded by the Identity/Auth service; never raw credentials.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Principal(v.to_string()))
            .ok_or_else(|| Error::Unauthorized("missing authenticated principal".to_string()))
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Camera registry
        .route("/cameras", get(list_cameras).post(register_camera))
        .route("/cameras/:camera_id", get(get_camera))
        .route("/cameras/:camera_id/status", put(mark_camera_status))
        .route("/cameras/:camera_id/provisioned", post(confirm_provisioned))
        .route("/cameras/:camera_id/device-info", get(device_info))
        // Sessions and negotiation
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", get(get_session).delete(close_session))
        .route("/sessions/:session_id/offer", post(submit_offer))
        .route("/sessions/:session_id/candidates", post(add_candidate))
        .route(
            "/sessions/:session_id/connection-state",
            post(report_connection_state),
        )
        .route("/sessions/:session_id/stats", post(publish_stats))
        // Control channel
        .route("/ws", get(control_channel))
        // Health check
        .route("/health", get(health_check))
        .with_state(state)
}

async fn list_cameras(
    State(state): State<AppState>,
    Query(filter): Query<CameraFilter>,
) -> Json<Vec<Camera>> {
    Json(state.registry.list(&filter).await)
}

async fn register_camera(
    State(state): State<AppState>,
    Json(registration): Json<CameraRegistration>,
) -> Result<(StatusCode, Json<Camera>)> {
    let id = state.registry.register(registration).await?;
    let camera = state.registry.get(&id).await?;
    Ok((StatusCode::CREATED, Json(camera)))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<Json<Camera>> {
    Ok(Json(state.registry.get(&camera_id).await?))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: CameraStatus,
}

async fn mark_camera_status(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Camera>> {
    state.registry.mark_status(&camera_id, update.status).await?;
    Ok(Json(state.registry.get(&camera_id).await?))
}

async fn confirm_provisioned(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<Json<Camera>> {
    state.registry.confirm_provisioned(&camera_id).await?;
    Ok(Json(state.registry.get(&camera_id).await?))
}

async fn device_info(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<Json<DeviceInfo>> {
    Ok(Json(state.relay.identify(&camera_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    camera_id: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>)> {
    let session = state.sessions.create_session(&request.camera_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>> {
    Ok(Json(state.sessions.get(&session_id).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    state
        .sessions
        .close(&session_id, CloseReason::ClientClosed)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_offer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(offer): Json<SessionDescription>,
) -> Result<Json<SessionDescription>> {
    Ok(Json(state.sessions.submit_offer(&session_id, offer).await?))
}

async fn add_candidate(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(candidate): Json<IceCandidate>,
) -> Result<StatusCode> {
    state
        .sessions
        .add_ice_candidate(&session_id, candidate)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ConnectionStateReport {
    state: ConnectionState,
}

async fn report_connection_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(report): Json<ConnectionStateReport>,
) -> Result<StatusCode> {
    state
        .sessions
        .report_connection_state(&session_id, report.state)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn publish_stats(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(stats): Json<StreamStats>,
) -> Result<StatusCode> {
    state.sessions.publish_stats(&session_id, stats).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn control_channel(
    principal: Principal,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let limit = state.max_message_bytes;
    ws.max_message_size(limit.saturating_mul(FRAME_LIMIT_FACTOR))
        .on_upgrade(move |socket| {
            channel::handle_socket(socket, state.sessions.clone(), principal.0, limit)
        })
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
