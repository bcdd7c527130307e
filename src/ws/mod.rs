//! WebSocket endpoints and per-session plumbing.
//!
//! Each accepted socket becomes three cooperating tasks: a writer draining
//! the session's outbound channel into the sink, a heartbeat timer, and the
//! read loop (run inline). The read loop returning triggers teardown:
//! heartbeat cancellation, ABA-safe registry removal, `last_seen` update,
//! then DEVICE_OFFLINE notification to live paired peers — in that order.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::error::ApiError;
use crate::registry::{OutboundFrame, SessionHandle};
use crate::relay::{self, RelayOutcome};
use crate::storage::{DeviceRole, DeviceRow};
use crate::AppContext;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound frames queued per session before sends start timing out.
const SESSION_BUFFER: usize = 64;

/// Inbound frame cap — relayed payloads are small JSON commands, not media.
const MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Deserialize)]
pub struct WsQuery {
    /// Browsers cannot set headers on the upgrade request, so the bearer
    /// token rides in the query string.
    token: String,
}

pub async fn ws_host(
    State(ctx): State<Arc<AppContext>>,
    Path(device_id): Path<i64>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let device = authorize(&ctx, device_id, &query.token, DeviceRole::Host).await?;
    Ok(ws
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| run_session(ctx, device, DeviceRole::Host, socket)))
}

pub async fn ws_client(
    State(ctx): State<Arc<AppContext>>,
    Path(device_id): Path<i64>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let device = authorize(&ctx, device_id, &query.token, DeviceRole::Client).await?;
    Ok(ws
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| run_session(ctx, device, DeviceRole::Client, socket)))
}

/// Token, ownership, and role are all re-checked on every session open;
/// failures reject the upgrade with a plain HTTP error.
async fn authorize(
    ctx: &AppContext,
    device_id: i64,
    token: &str,
    expected: DeviceRole,
) -> Result<DeviceRow, ApiError> {
    let user_id = auth::verify_token(&ctx.config.jwt_secret, token)?;
    ctx.storage
        .get_device(device_id)
        .await?
        .filter(|d| d.user_id == user_id)
        .filter(|d| d.role() == Some(expected))
        .ok_or_else(|| ApiError::Forbidden("Device not found or not yours".to_string()))
}

// ─── Session lifecycle ───────────────────────────────────────────────────────

async fn run_session(ctx: Arc<AppContext>, device: DeviceRow, role: DeviceRole, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<OutboundFrame>(SESSION_BUFFER);
    let writer = tokio::spawn(write_frames(sink, rx));

    let session = SessionHandle::new(device.id, role, tx);

    // Binding evicts any predecessor; its channel is closed out here, never
    // under the registry mutex.
    if let Some(previous) = ctx.registry.bind(session.clone()).await {
        debug!(device = device.id, "evicting previous session");
        previous.close_replaced().await;
    }

    if let Err(e) = ctx.storage.touch_last_seen(device.id).await {
        warn!(err = %e, device = device.id, "failed to update last_seen on connect");
    }
    info!(device = device.id, role = role.as_str(), "session connected");

    let greeting = json!({ "type": "connected", "device_id": device.id });
    if session.send_json(&greeting).await.is_ok() {
        let heartbeat = tokio::spawn(heartbeat_loop(session.clone()));

        // Queued commands go out after the greeting and before any live
        // frame is read.
        if role == DeviceRole::Host {
            relay::drain_pending(&ctx, &session).await;
        }

        read_loop(&ctx, &session, stream).await;

        // Heartbeat dies before the offline notification runs.
        heartbeat.abort();
    }

    let removed = ctx.registry.unbind_if(&session).await;
    if let Err(e) = ctx.storage.touch_last_seen(device.id).await {
        warn!(err = %e, device = device.id, "failed to update last_seen on disconnect");
    }
    // An evicted session leaves a live successor behind — only a session
    // that actually vacated the registry reports the device offline.
    if removed {
        relay::notify_peers_offline(&ctx, device.id, role).await;
    }
    info!(device = device.id, evicted = !removed, "session closed");

    drop(session);
    let _ = writer.await;
}

/// Sole owner of the socket sink. Ends on channel close or after emitting a
/// close frame (eviction).
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Text(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Server-initiated liveness probe. A failed send means the writer is gone;
/// the read loop observes the closed socket and runs teardown.
async fn heartbeat_loop(session: SessionHandle) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        if session.send_json(&json!({ "type": "ping" })).await.is_err() {
            break;
        }
    }
}

// ─── Read loop ───────────────────────────────────────────────────────────────

async fn read_loop(ctx: &AppContext, session: &SessionHandle, mut stream: SplitStream<WebSocket>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(ctx, session, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(device = session.device_id, err = %e, "socket error");
                break;
            }
            // Protocol ping/pong and binary frames carry nothing for us.
            _ => {}
        }
    }
}

async fn handle_frame(ctx: &AppContext, session: &SessionHandle, text: &str) {
    let Ok(mut payload) = serde_json::from_str::<Map<String, Value>>(text) else {
        reply(session, &json!({ "error": "invalid JSON" })).await;
        return;
    };

    let msg_type = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match msg_type.as_str() {
        // Liveness probe from the peer — answered, never relayed or logged.
        "ping" => {
            reply(session, &json!({ "type": "pong" })).await;
        }
        "command" | "event" | "webrtc" => {
            relay_frame(ctx, session, &mut payload).await;
        }
        other => {
            reply(
                session,
                &json!({ "error": format!("invalid message type: {other}") }),
            )
            .await;
        }
    }
}

async fn relay_frame(ctx: &AppContext, session: &SessionHandle, payload: &mut Map<String, Value>) {
    // Explicit target wins; otherwise the sender's sole pairing decides.
    let target = match payload.get("to_device_id").and_then(Value::as_i64) {
        Some(id) => id,
        None => match ctx
            .storage
            .first_pairing_for(session.device_id, session.role)
            .await
        {
            Ok(Some(pairing)) => match session.role {
                DeviceRole::Client => pairing.host_device_id,
                DeviceRole::Host => pairing.client_device_id,
            },
            Ok(None) => {
                let error = match session.role {
                    DeviceRole::Client => "no paired host",
                    DeviceRole::Host => "no paired client",
                };
                reply(session, &json!({ "error": error })).await;
                return;
            }
            Err(e) => {
                error!(err = %e, device = session.device_id, "pairing lookup failed");
                reply(session, &json!({ "error": "internal error" })).await;
                return;
            }
        },
    };

    // The server vouches for the sender — never the frame itself.
    payload.insert("from_device_id".to_string(), json!(session.device_id));

    match relay::relay_message(ctx, target, payload, session.device_id).await {
        Ok(RelayOutcome::Sent { .. }) => {}
        Ok(RelayOutcome::Queued { req_id }) => {
            reply(session, &json!({ "status": "queued", "req_id": req_id })).await;
        }
        Ok(RelayOutcome::TargetOffline { req_id }) => {
            reply(
                session,
                &json!({
                    "error": "target_offline",
                    "target_device_id": target,
                    "req_id": req_id,
                }),
            )
            .await;
        }
        Err(_) => {
            let req_id = payload.get("req_id").cloned().unwrap_or(Value::Null);
            reply(
                session,
                &json!({
                    "error": "delivery_failed",
                    "target_device_id": target,
                    "req_id": req_id,
                }),
            )
            .await;
        }
    }
}

async fn reply(session: &SessionHandle, value: &Value) {
    if session.send_json(value).await.is_err() {
        debug!(device = session.device_id, "reply dropped — session closing");
    }
}
