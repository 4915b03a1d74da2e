//! Black-box integration tests against a running gateway binary.
//!
//! Grounded in the teacher's `sr-api/tests/integration/work_surface_start_test.rs`:
//! a `TestConfig`/`TestClient` pair built from env vars with sane
//! localhost defaults, and `#[ignore]`d tests that only run when a real
//! server (here: the gateway plus a real NATS/JetStream deployment) is
//! actually up. `cargo test -- --ignored` against a docker-composed
//! gateway + NATS is how these are meant to be run; they are skipped by
//! a plain `cargo test` the same way the teacher's are.
//!
//! Requires:
//! - A running gw-gateway at GW_TEST_URL (default: http://localhost:8080)
//! - GW_JWT_SECRET on the gateway matching GW_TEST_JWT_SECRET here
//!   (default: "test-secret" on both sides)
//! - A NATS/JetStream server reachable by the gateway under test

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct TestConfig {
    http_base_url: String,
    ws_url: String,
    jwt_secret: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        let http_base_url = std::env::var("GW_TEST_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());
        let ws_url = std::env::var("GW_TEST_WS_URL").unwrap_or_else(|_| {
            format!(
                "{}/ws",
                http_base_url.replacen("http://", "ws://", 1).replacen("https://", "wss://", 1)
            )
        });
        Self {
            http_base_url,
            ws_url,
            jwt_secret: std::env::var("GW_TEST_JWT_SECRET")
                .unwrap_or_else(|_| "test-secret".to_string()),
        }
    }
}

struct TestClient {
    http: reqwest::Client,
    config: TestConfig,
}

impl TestClient {
    fn new(config: TestConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.http_base_url.trim_end_matches('/'), path)
    }

    /// Mints an HS256 device token the same shape `JwtTokenValidator`
    /// expects: `sub`, `pub`/`subscribe` as comma-separated strings,
    /// `exp` one hour out.
    fn device_token(&self, client_id: &str, pub_patterns: &str, sub_patterns: &str) -> String {
        #[derive(Serialize)]
        struct Claims<'a> {
            sub: &'a str,
            #[serde(rename = "pub")]
            pub_: &'a str,
            subscribe: &'a str,
            exp: i64,
        }
        let claims = Claims {
            sub: client_id,
            pub_: pub_patterns,
            subscribe: sub_patterns,
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .expect("failed to mint test JWT")
    }
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    message_type: u8,
    subject: Option<String>,
    payload: Option<serde_json::Value>,
    #[serde(rename = "correlationId")]
    correlation_id: Option<String>,
}

const TYPE_PUBLISH: u8 = 0;
const TYPE_SUBSCRIBE: u8 = 1;
const TYPE_MESSAGE: u8 = 3;
const TYPE_ACK: u8 = 6;
const TYPE_ERROR: u8 = 7;
const TYPE_AUTH: u8 = 8;

async fn recv_frame(
    stream: &mut (impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> WireFrame {
    loop {
        let msg = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed before a frame arrived")
            .expect("websocket transport error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).expect("non-wire-protocol text frame");
        }
    }
}

// =============================================================================
// Test 1: Health check needs no auth and no live NATS dependency
// =============================================================================

#[tokio::test]
#[ignore] // Requires a running gateway
async fn test_health_check_ok() {
    let client = TestClient::new(TestConfig::default());
    let resp = client
        .http
        .get(&client.url("/health"))
        .send()
        .await
        .expect("GET /health failed");
    assert!(resp.status().is_success());
}

// =============================================================================
// Test 2: Pre-upgrade bearer auth, publish/subscribe round trip
// =============================================================================

#[tokio::test]
#[ignore] // Requires a running gateway plus JetStream
async fn test_publish_subscribe_round_trip() {
    let client = TestClient::new(TestConfig::default());
    let client_id = format!("itest-{}", uuid_like());
    let token = client.device_token(&client_id, "itest.>", "itest.>");

    let (mut ws, _resp) = tokio_tungstenite::connect_async(auth_request(&client, &token))
        .await
        .expect("websocket connect failed");

    let subscribe = json!({ "type": TYPE_SUBSCRIBE, "subject": format!("itest.{client_id}.cmd") });
    ws.send(WsMessage::Text(subscribe.to_string()))
        .await
        .expect("send SUBSCRIBE failed");
    let ack = recv_frame(&mut ws).await;
    assert_eq!(ack.message_type, TYPE_ACK);

    let publish = json!({
        "type": TYPE_PUBLISH,
        "subject": format!("itest.{client_id}.cmd"),
        "payload": { "hello": "world" },
        "correlationId": "corr-1",
    });
    ws.send(WsMessage::Text(publish.to_string()))
        .await
        .expect("send PUBLISH failed");
    let publish_ack = recv_frame(&mut ws).await;
    assert_eq!(publish_ack.message_type, TYPE_ACK);
    assert_eq!(publish_ack.correlation_id.as_deref(), Some("corr-1"));

    let delivered = recv_frame(&mut ws).await;
    assert_eq!(delivered.message_type, TYPE_MESSAGE);
    assert_eq!(delivered.subject.as_deref(), Some(format!("itest.{client_id}.cmd").as_str()));
    assert_eq!(
        delivered.payload,
        Some(json!({ "hello": "world" }))
    );

    ws.close(None).await.ok();
}

// =============================================================================
// Test 3: In-band AUTH frame (no pre-upgrade header) authenticates too
// =============================================================================

#[tokio::test]
#[ignore] // Requires a running gateway
async fn test_in_band_auth_frame_authenticates() {
    let client = TestClient::new(TestConfig::default());
    let client_id = format!("itest-inband-{}", uuid_like());
    let token = client.device_token(&client_id, "itest.>", "itest.>");

    let (mut ws, _resp) = tokio_tungstenite::connect_async(client.config.ws_url.as_str())
        .await
        .expect("websocket connect failed");

    let auth = json!({ "type": TYPE_AUTH, "payload": { "token": token } });
    ws.send(WsMessage::Text(auth.to_string()))
        .await
        .expect("send AUTH failed");

    let ack = recv_frame(&mut ws).await;
    assert_eq!(ack.message_type, TYPE_ACK);

    ws.close(None).await.ok();
}

// =============================================================================
// Test 4: Publish outside the token's pub_patterns is rejected, not dropped silently
// =============================================================================

#[tokio::test]
#[ignore] // Requires a running gateway
async fn test_publish_outside_authorized_patterns_yields_error_frame() {
    let client = TestClient::new(TestConfig::default());
    let client_id = format!("itest-unauth-{}", uuid_like());
    // pub_patterns intentionally excludes the subject below.
    let token = client.device_token(&client_id, "itest.allowed.>", "itest.allowed.>");

    let (mut ws, _resp) = tokio_tungstenite::connect_async(client.config.ws_url.as_str())
        .await
        .expect("websocket connect failed");

    let auth = json!({ "type": TYPE_AUTH, "payload": { "token": token } });
    ws.send(WsMessage::Text(auth.to_string())).await.unwrap();
    let ack = recv_frame(&mut ws).await;
    assert_eq!(ack.message_type, TYPE_ACK);

    let publish = json!({
        "type": TYPE_PUBLISH,
        "subject": "itest.forbidden.subject",
        "payload": {},
    });
    ws.send(WsMessage::Text(publish.to_string())).await.unwrap();

    let error = recv_frame(&mut ws).await;
    assert_eq!(error.message_type, TYPE_ERROR);

    ws.close(None).await.ok();
}

// =============================================================================
// Test 5: Admin disconnect evicts the live session
// =============================================================================

#[tokio::test]
#[ignore] // Requires a running gateway
async fn test_admin_disconnect_closes_the_session() {
    let client = TestClient::new(TestConfig::default());
    let client_id = format!("itest-evict-{}", uuid_like());
    let token = client.device_token(&client_id, "itest.>", "itest.>");

    let (mut ws, _resp) = tokio_tungstenite::connect_async(auth_request(&client, &token))
        .await
        .expect("websocket connect failed");

    let resp = client
        .http
        .post(&client.url(&format!("/devices/{client_id}/disconnect")))
        .send()
        .await
        .expect("disconnect request failed");
    assert_eq!(resp.status().as_u16(), 202);

    let closed = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for close frame");
    match closed {
        Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, 4001u16.into()),
        Some(Ok(WsMessage::Close(None))) | None => {}
        other => panic!("expected a close frame, got {other:?}"),
    }
}

// =============================================================================
// Test 6: /devices reflects a connected session
// =============================================================================

#[tokio::test]
#[ignore] // Requires a running gateway
async fn test_devices_endpoint_lists_connected_session() {
    let client = TestClient::new(TestConfig::default());
    let client_id = format!("itest-list-{}", uuid_like());
    let token = client.device_token(&client_id, "itest.>", "itest.>");

    let (_ws, _resp) = tokio_tungstenite::connect_async(auth_request(&client, &token))
        .await
        .expect("websocket connect failed");

    let resp: serde_json::Value = client
        .http
        .get(&client.url("/devices"))
        .send()
        .await
        .expect("GET /devices failed")
        .json()
        .await
        .expect("failed to parse /devices response");

    let devices = resp["devices"].as_array().expect("devices should be an array");
    assert!(devices.iter().any(|d| d["clientId"] == client_id));
}

/// A pre-upgrade WS request carrying the device's bearer token, per
/// the short-circuit path `listener::ws_upgrade` takes when an
/// `Authorization` header is present.
fn auth_request(
    client: &TestClient,
    token: &str,
) -> tokio_tungstenite::tungstenite::http::Request<()> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = client
        .config
        .ws_url
        .as_str()
        .into_client_request()
        .expect("invalid websocket url");
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    request
}

fn uuid_like() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{nanos:x}")
}
