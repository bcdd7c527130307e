//! Shared harness for the integration tests: spins up a real relay on an
//! OS-assigned port inside the test process.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use simbridged::{
    auth::google::{GoogleIdentity, IdTokenVerifier},
    auth::rate_limit::RateLimiter,
    config::ServerConfig,
    error::ApiError,
    registry::SessionRegistry,
    rest,
    storage::Storage,
    AppContext,
};

pub type WsConn = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub base_url: String,
    pub ws_base: String,
    pub http: reqwest::Client,
    pub ctx: Arc<AppContext>,
    _data_dir: tempfile::TempDir,
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with_google(None).await
}

pub async fn spawn_server_with_google(
    google: Option<Arc<dyn IdTokenVerifier>>,
) -> TestServer {
    let data_dir = tempfile::tempdir().unwrap();
    let db_path = data_dir.path().join("test.db");

    let config = Arc::new(ServerConfig {
        port: 0,
        db_path: db_path.clone(),
        log: "warn".to_string(),
        jwt_secret: "integration-test-secret".to_string(),
        google_client_id: None,
        token_expiry_hours: 24,
        log_retention_days: 90,
    });
    let storage = Arc::new(Storage::new(&db_path).await.unwrap());
    let ctx = Arc::new(AppContext {
        config,
        storage,
        registry: Arc::new(SessionRegistry::new()),
        limiter: Arc::new(RateLimiter::new()),
        google,
        started_at: std::time::Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = rest::build_router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        http: reqwest::Client::new(),
        ctx,
        _data_dir: data_dir,
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn ws_url(&self, role: &str, device_id: i64, token: &str) -> String {
        format!("{}/ws/{role}/{device_id}?token={token}", self.ws_base)
    }

    /// Register a user and log them in; returns `(token, user_id)`.
    pub async fn register_and_login(&self, username: &str) -> (String, i64) {
        let resp = self
            .http
            .post(self.url("/auth/register"))
            .json(&json!({ "username": username, "password": "testpass" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "register failed for {username}");

        let resp = self
            .http
            .post(self.url("/auth/login"))
            .json(&json!({ "username": username, "password": "testpass" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "login failed for {username}");
        let body: Value = resp.json().await.unwrap();
        (
            body["token"].as_str().unwrap().to_string(),
            body["user_id"].as_i64().unwrap(),
        )
    }

    pub async fn create_device(&self, token: &str, name: &str, device_type: &str) -> i64 {
        let resp = self
            .http
            .post(self.url("/devices"))
            .bearer_auth(token)
            .json(&json!({ "name": name, "type": device_type }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "create_device failed for {name}");
        let body: Value = resp.json().await.unwrap();
        body["id"].as_i64().unwrap()
    }

    /// Issue a code on the host and confirm it from the client. Panics
    /// unless the outcome is `paired` or `already_paired`.
    pub async fn pair(&self, token: &str, host_id: i64, client_id: i64) -> i64 {
        let resp = self
            .http
            .post(self.url(&format!("/pair?host_device_id={host_id}")))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let code = resp.json::<Value>().await.unwrap()["code"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = self
            .http
            .post(self.url("/pair/confirm"))
            .bearer_auth(token)
            .json(&json!({ "code": code, "client_device_id": client_id }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert!(
            body["status"] == "paired" || body["status"] == "already_paired",
            "unexpected pairing outcome: {body}"
        );
        body["pairing_id"].as_i64().unwrap()
    }
}

// ─── WebSocket helpers ───────────────────────────────────────────────────────

pub async fn ws_connect(url: &str) -> WsConn {
    let (ws, _) = connect_async(url).await.expect("ws connect failed");
    ws
}

pub async fn ws_send_json(ws: &mut WsConn, value: &Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping protocol ping/pong. Panics after 2 s.
pub async fn ws_recv_json(ws: &mut WsConn) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for ws frame")
            .expect("ws stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected ws frame: {other:?}"),
        }
    }
}

/// Asserts that nothing arrives on `ws` within `wait`.
pub async fn ws_expect_silence(ws: &mut WsConn, wait: Duration) {
    let result = tokio::time::timeout(wait, ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("unexpected message: {text}");
    }
}

// ─── Stub Google verifier ────────────────────────────────────────────────────

/// Accepts exactly the token `"valid-token"`, yielding a fixed identity.
pub struct StubVerifier {
    pub subject: String,
    pub email: Option<String>,
}

impl StubVerifier {
    pub fn standard() -> Arc<dyn IdTokenVerifier> {
        Arc::new(Self {
            subject: "google-uid-123".to_string(),
            email: Some("googleuser@gmail.com".to_string()),
        })
    }
}

#[async_trait]
impl IdTokenVerifier for StubVerifier {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, ApiError> {
        if id_token == "valid-token" {
            Ok(GoogleIdentity {
                subject: self.subject.clone(),
                email: self.email.clone(),
            })
        } else {
            Err(ApiError::Unauthorized("Invalid Google token".to_string()))
        }
    }
}
