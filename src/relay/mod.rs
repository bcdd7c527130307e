//! Message relay engine — the critical path.
//!
//! Invoked from the HTTP command endpoints and from every inbound WebSocket
//! frame. Resolves the target session from the registry, writes the message
//! log, and either delivers live or queues for a disconnected host. Holds
//! no state of its own: sessions belong to the registry, rows to the store.

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::registry::SessionHandle;
use crate::storage::DeviceRole;
use crate::AppContext;

/// Payload `type` values that are logged under their own name; anything
/// else is recorded as `unknown`.
const KNOWN_KINDS: [&str; 4] = ["command", "event", "webrtc", "ping"];

#[derive(Debug)]
pub enum RelayOutcome {
    /// Delivered on the target's live channel.
    Sent { req_id: String },
    /// Target host offline — persisted for delivery on reconnect.
    Queued { req_id: String },
    /// Target client offline (or unknown device) — nothing to queue.
    TargetOffline { req_id: String },
}

/// Returns the payload's `req_id`, attaching a fresh one when absent, so
/// every relayed message is correlatable end to end.
pub fn ensure_req_id(payload: &mut Map<String, Value>) -> String {
    if let Some(id) = payload.get("req_id").and_then(Value::as_str) {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    let id = Uuid::new_v4().to_string();
    payload.insert("req_id".to_string(), Value::String(id.clone()));
    id
}

fn message_kind(payload: &Map<String, Value>) -> String {
    payload
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| KNOWN_KINDS.contains(t))
        .unwrap_or("unknown")
        .to_string()
}

/// Relay `payload` to `target_device_id` on behalf of `from_device_id`.
///
/// The message log and pending-queue writes never fail the relay: a broken
/// log must not cost a delivery. A failed send to a *live* session is an
/// error (502 on the HTTP path) rather than a fallthrough to the queue —
/// a registered-but-broken channel is a condition the caller should see.
pub async fn relay_message(
    ctx: &AppContext,
    target_device_id: i64,
    payload: &mut Map<String, Value>,
    from_device_id: i64,
) -> Result<RelayOutcome, ApiError> {
    let req_id = ensure_req_id(payload);
    let kind = message_kind(payload);
    let text = Value::Object(payload.clone()).to_string();

    let session = ctx.registry.lookup(target_device_id).await;

    if let Err(e) = ctx
        .storage
        .log_message(from_device_id, target_device_id, &kind, &text)
        .await
    {
        error!(err = %e, from = from_device_id, to = target_device_id, "failed to write message log");
    }

    if let Some(session) = session {
        if session.send_text(text).await.is_err() {
            warn!(to = target_device_id, req_id = %req_id, "send to live session failed");
            return Err(ApiError::DeliveryFailed);
        }
        return Ok(RelayOutcome::Sent { req_id });
    }

    let target_role = ctx
        .storage
        .get_device(target_device_id)
        .await?
        .and_then(|d| d.role());

    if target_role == Some(DeviceRole::Host) {
        if let Err(e) = ctx
            .storage
            .queue_command(target_device_id, from_device_id, &text)
            .await
        {
            error!(err = %e, to = target_device_id, "failed to queue command for offline host");
        }
        return Ok(RelayOutcome::Queued { req_id });
    }

    Ok(RelayOutcome::TargetOffline { req_id })
}

// ─── HTTP command path ───────────────────────────────────────────────────────

/// Authorization preamble for `/sms`, `/call`, `/sims`: the caller must own
/// a client device (the first one becomes the sender), that client must be
/// paired with the target host, and the host must belong to the caller.
/// Returns the sender's device id.
pub async fn resolve_http_sender(
    ctx: &AppContext,
    user_id: i64,
    host_device_id: i64,
) -> Result<i64, ApiError> {
    let Some(client) = ctx.storage.first_client_device(user_id).await? else {
        return Err(ApiError::BadRequest(
            "No client device registered".to_string(),
        ));
    };

    if ctx
        .storage
        .find_pairing(host_device_id, client.id)
        .await?
        .is_none()
    {
        return Err(ApiError::Forbidden("Devices are not paired".to_string()));
    }

    let Some(host) = ctx.storage.get_device(host_device_id).await? else {
        return Err(ApiError::NotFound("Host device not found".to_string()));
    };
    if host.user_id != user_id {
        return Err(ApiError::Forbidden(
            "Host device belongs to a different account".to_string(),
        ));
    }

    Ok(client.id)
}

pub fn sms_command(sim: i64, to: &str, body: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("type".to_string(), json!("command"));
    payload.insert("cmd".to_string(), json!("SEND_SMS"));
    payload.insert("sim".to_string(), json!(sim));
    payload.insert("to".to_string(), json!(to));
    payload.insert("body".to_string(), json!(body));
    payload
}

pub fn call_command(sim: i64, to: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("type".to_string(), json!("command"));
    payload.insert("cmd".to_string(), json!("MAKE_CALL"));
    payload.insert("sim".to_string(), json!(sim));
    payload.insert("to".to_string(), json!(to));
    payload
}

pub fn sims_command() -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("type".to_string(), json!("command"));
    payload.insert("cmd".to_string(), json!("GET_SIMS"));
    payload
}

// ─── Reconnect drain ─────────────────────────────────────────────────────────

/// Deliver queued commands to a freshly connected host in insertion order.
/// Runs after the `connected` greeting and before the read loop. Each row
/// is marked delivered only after its send succeeds; the first failure
/// aborts the drain and leaves the remainder for the next reconnect.
pub async fn drain_pending(ctx: &AppContext, session: &SessionHandle) {
    let pending = match ctx.storage.undelivered_commands(session.device_id).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(err = %e, host = session.device_id, "failed to read pending commands");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    let total = pending.len();
    let mut delivered = 0usize;
    for cmd in pending {
        if session.send_text(cmd.payload.clone()).await.is_err() {
            warn!(
                host = session.device_id,
                delivered, total, "drain aborted — send failed"
            );
            return;
        }
        if let Err(e) = ctx.storage.mark_command_delivered(cmd.id).await {
            // Stop rather than risk re-sending an unmarked command forever.
            error!(err = %e, id = cmd.id, "failed to mark command delivered — drain aborted");
            return;
        }
        delivered += 1;
    }
    info!(host = session.device_id, delivered, "drained pending commands");
}

// ─── Offline notification ────────────────────────────────────────────────────

/// Tell every live paired peer on the opposite side that `device_id` went
/// away. Send failures are ignored — the peer's own teardown handles it.
pub async fn notify_peers_offline(ctx: &AppContext, device_id: i64, role: DeviceRole) {
    let peers = match ctx.storage.paired_peer_ids(device_id, role).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(err = %e, device = device_id, "failed to look up paired peers");
            return;
        }
    };
    for peer_id in peers {
        if let Some(peer) = ctx.registry.lookup(peer_id).await {
            let frame = json!({
                "type": "event",
                "event": "DEVICE_OFFLINE",
                "device_id": device_id,
            });
            let _ = peer.send_json(&frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OutboundFrame, SessionRegistry};
    use crate::storage::Storage;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn test_ctx() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("relay.db")).await.unwrap();
        let ctx = Arc::new(AppContext {
            config: Arc::new(crate::config::ServerConfig {
                port: 0,
                db_path: dir.path().join("relay.db"),
                log: "warn".to_string(),
                jwt_secret: "test-secret".to_string(),
                google_client_id: None,
                token_expiry_hours: 24,
                log_retention_days: 90,
            }),
            storage: Arc::new(storage),
            registry: Arc::new(SessionRegistry::new()),
            limiter: Arc::new(crate::auth::rate_limit::RateLimiter::new()),
            google: None,
            started_at: std::time::Instant::now(),
        });
        (ctx, dir)
    }

    async fn seed_pair(ctx: &AppContext) -> (i64, i64) {
        let user = ctx
            .storage
            .create_user("u", Some("x"), None, None)
            .await
            .unwrap();
        let host = ctx
            .storage
            .create_device(user.id, "Phone", DeviceRole::Host)
            .await
            .unwrap();
        let client = ctx
            .storage
            .create_device(user.id, "Laptop", DeviceRole::Client)
            .await
            .unwrap();
        (host.id, client.id)
    }

    #[tokio::test]
    async fn offline_host_target_queues() {
        let (ctx, _dir) = test_ctx().await;
        let (host_id, client_id) = seed_pair(&ctx).await;

        let mut payload = sms_command(1, "+15550001", "hi");
        let outcome = relay_message(&ctx, host_id, &mut payload, client_id)
            .await
            .unwrap();
        let req_id = match outcome {
            RelayOutcome::Queued { req_id } => req_id,
            _ => panic!("expected Queued"),
        };

        let pending = ctx.storage.undelivered_commands(host_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        let stored: Value = serde_json::from_str(&pending[0].payload).unwrap();
        assert_eq!(stored["req_id"], json!(req_id));
        assert_eq!(stored["cmd"], json!("SEND_SMS"));
    }

    #[tokio::test]
    async fn offline_client_target_does_not_queue() {
        let (ctx, _dir) = test_ctx().await;
        let (host_id, client_id) = seed_pair(&ctx).await;

        let mut payload = Map::new();
        payload.insert("type".to_string(), json!("event"));
        let outcome = relay_message(&ctx, client_id, &mut payload, host_id)
            .await
            .unwrap();
        assert!(matches!(outcome, RelayOutcome::TargetOffline { .. }));
        assert!(ctx
            .storage
            .undelivered_commands(client_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn live_target_receives_frame_and_log_row_matches() {
        let (ctx, _dir) = test_ctx().await;
        let (host_id, client_id) = seed_pair(&ctx).await;

        let (tx, mut rx) = mpsc::channel(8);
        let session = SessionHandle::new(host_id, DeviceRole::Host, tx);
        ctx.registry.bind(session).await;

        let mut payload = sms_command(2, "+15550002", "yo");
        let outcome = relay_message(&ctx, host_id, &mut payload, client_id)
            .await
            .unwrap();
        assert!(matches!(outcome, RelayOutcome::Sent { .. }));

        let frame = rx.recv().await.unwrap();
        let OutboundFrame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let sent: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(sent["cmd"], json!("SEND_SMS"));

        // Invariant: a matching log row exists for the delivered command.
        let user = ctx.storage.find_user_by_username("u").await.unwrap().unwrap();
        let (items, total) = ctx.storage.history(user.id, None, 50, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].from_device_id, client_id);
        assert_eq!(items[0].to_device_id, host_id);
        assert_eq!(items[0].msg_kind, "command");
        assert_eq!(items[0].payload, text);
    }

    #[tokio::test]
    async fn broken_live_session_is_delivery_failure_not_queue() {
        let (ctx, _dir) = test_ctx().await;
        let (host_id, client_id) = seed_pair(&ctx).await;

        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        ctx.registry
            .bind(SessionHandle::new(host_id, DeviceRole::Host, tx))
            .await;

        let mut payload = sms_command(1, "+15550003", "nope");
        let err = relay_message(&ctx, host_id, &mut payload, client_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::DeliveryFailed));
        assert!(ctx
            .storage
            .undelivered_commands(host_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn existing_req_id_is_preserved() {
        let mut payload = Map::new();
        payload.insert("req_id".to_string(), json!("abc-123"));
        assert_eq!(ensure_req_id(&mut payload), "abc-123");

        let mut payload = Map::new();
        let generated = ensure_req_id(&mut payload);
        assert_eq!(payload.get("req_id"), Some(&json!(generated)));
    }
}
