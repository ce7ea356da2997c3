use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use camera_orchestrator::camera::Camera;
use camera_orchestrator::config::AppConfig;
use camera_orchestrator::relay::{DeviceCall, DeviceError, DeviceResponse, DeviceTransport, Route};
use camera_orchestrator::server::{self, AppState, PRINCIPAL_HEADER};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONFIG: &str = r#"
cameras:
  - id: cam-1
    address: "192.168.1.20:80"
    model: "AXIS Q6135-LE"
    capabilities: [ptz, video]
    username: root
    password: pass
    provisioned: true
    initial_status: online
"#;

const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\na=rtpmap:96 VP8/90000\r\n";

/// Camera that acknowledges every call
struct AckTransport;

#[async_trait]
impl DeviceTransport for AckTransport {
    async fn probe_local(&self, _camera: &Camera) -> bool {
        true
    }

    async fn send(
        &self,
        _route: Route,
        _camera: &Camera,
        _call: &DeviceCall,
    ) -> Result<DeviceResponse, DeviceError> {
        Ok(DeviceResponse {
            status: 200,
            body: String::new(),
        })
    }
}

/// Start the orchestrator on an ephemeral port, return the bound address.
async fn start() -> (SocketAddr, AppState) {
    let config = AppConfig::from_yaml_str(CONFIG).unwrap();
    let state = AppState::build(&config, Arc::new(AckTransport)).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = state.clone();
    tokio::spawn(async move {
        server::serve(listener, served).await.unwrap();
    });

    (addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(PRINCIPAL_HEADER, HeaderValue::from_static("viewer-1"));
    let (client, _) = connect_async(request).await.unwrap();
    client
}

async fn send(client: &mut Client, message: Value) {
    client.send(Message::Text(message.to_string())).await.unwrap();
}

/// Reads until a message of the given type arrives.
async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == kind {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

async fn subscribe(client: &mut Client, session_id: &str) {
    send(
        client,
        json!({ "type": "subscribe", "payload": { "sessionId": session_id } }),
    )
    .await;
    let connected = next_of_type(client, "connected").await;
    assert_eq!(connected["sessionId"], session_id);
}

#[tokio::test]
async fn test_ptz_executed_reaches_every_subscriber() {
    let (addr, state) = start().await;
    let session = state.sessions.create_session("cam-1").await.unwrap();

    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    subscribe(&mut first, &session.id).await;
    subscribe(&mut second, &session.id).await;

    send(
        &mut first,
        json!({
            "type": "ptz_command",
            "payload": { "command": "absolute", "params": { "pan": 45, "tilt": 30, "zoom": 1.8 } }
        }),
    )
    .await;

    let seen_by_first = next_of_type(&mut first, "ptz_executed").await;
    let seen_by_second = next_of_type(&mut second, "ptz_executed").await;

    assert_eq!(seen_by_first, seen_by_second);
    assert_eq!(seen_by_first["data"]["command"], "absolute");
    assert_eq!(seen_by_first["data"]["status"], "success");

    let camera = state.registry.get("cam-1").await.unwrap();
    assert_eq!(camera.ptz_position.pan, 45.0);
}

#[tokio::test]
async fn test_out_of_range_is_reported_to_sender() {
    let (addr, state) = start().await;
    let session = state.sessions.create_session("cam-1").await.unwrap();
    let mut client = connect(addr).await;
    subscribe(&mut client, &session.id).await;

    send(
        &mut client,
        json!({
            "type": "ptz_command",
            "payload": { "command": "absolute", "params": { "pan": 999 } }
        }),
    )
    .await;

    let error = next_of_type(&mut client, "error").await;
    assert_eq!(error["code"], "OUT_OF_RANGE");
    let camera = state.registry.get("cam-1").await.unwrap();
    assert_eq!(camera.ptz_position.pan, 0.0);
}

#[tokio::test]
async fn test_malformed_json_keeps_connection_open() {
    let (addr, state) = start().await;
    let session = state.sessions.create_session("cam-1").await.unwrap();
    let mut client = connect(addr).await;
    subscribe(&mut client, &session.id).await;

    client
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    let error = next_of_type(&mut client, "error").await;
    assert_eq!(error["code"], "SERIALIZATION_ERROR");

    send(&mut client, json!({ "type": "ping" })).await;
    next_of_type(&mut client, "pong").await;
}

#[tokio::test]
async fn test_oversized_message_keeps_connection_open() {
    let (addr, _state) = start().await;
    let mut client = connect(addr).await;

    let padding = "x".repeat(300 * 1024);
    send(&mut client, json!({ "type": "ping", "payload": { "padding": padding } })).await;
    let error = next_of_type(&mut client, "error").await;
    assert_eq!(error["code"], "MESSAGE_TOO_LARGE");

    send(&mut client, json!({ "type": "ping" })).await;
    next_of_type(&mut client, "pong").await;
}

#[tokio::test]
async fn test_frame_over_hard_cap_closes_with_size_code() {
    let (addr, _state) = start().await;
    let mut client = connect(addr).await;

    // Four times the 256 KB message limit is the most the socket reads.
    let padding = "x".repeat(1200 * 1024);
    send(&mut client, json!({ "type": "ping", "payload": { "padding": padding } })).await;

    let frame = timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("connection ended without a close frame: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for close");
    assert_eq!(frame.map(|f| f.code), Some(CloseCode::Size));

    // Other connections are unaffected.
    let mut fresh = connect(addr).await;
    send(&mut fresh, json!({ "type": "ping" })).await;
    next_of_type(&mut fresh, "pong").await;
}

#[tokio::test]
async fn test_commands_require_subscription() {
    let (addr, _state) = start().await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "get_stats" })).await;
    let error = next_of_type(&mut client, "error").await;
    assert_eq!(error["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_offer_over_channel_returns_answer() {
    let (addr, state) = start().await;
    let session = state.sessions.create_session("cam-1").await.unwrap();
    let mut client = connect(addr).await;
    subscribe(&mut client, &session.id).await;

    send(&mut client, json!({ "type": "offer", "payload": { "sdp": OFFER } })).await;

    let answer = next_of_type(&mut client, "answer").await;
    assert_eq!(answer["sessionId"], session.id);
    assert!(answer["sdp"].as_str().unwrap().contains("a=setup:active"));
    let stored = state.sessions.get(&session.id).await.unwrap();
    assert_eq!(stored.status.to_string(), "active");
}

#[tokio::test]
async fn test_disconnect_leaves_session_open() {
    let (addr, state) = start().await;
    let session = state.sessions.create_session("cam-1").await.unwrap();
    let mut client = connect(addr).await;
    subscribe(&mut client, &session.id).await;

    client.close(None).await.unwrap();
    drop(client);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = state.sessions.get(&session.id).await.unwrap();
    assert_eq!(stored.status.to_string(), "initializing");
}

#[tokio::test]
async fn test_missing_principal_is_refused() {
    let (addr, _state) = start().await;

    let result = connect_async(format!("ws://{}/ws", addr)).await;
    assert!(result.is_err());
}
