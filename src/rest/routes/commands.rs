//! HTTP command endpoints — the REST fallback for clients without an open
//! session. Each one resolves the caller's implicit sender device, runs the
//! relay, and reports `sent` or `queued`.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::relay::{self, RelayOutcome};
use crate::AppContext;

const MAX_RECIPIENT_LEN: usize = 30;
const MAX_SMS_BODY_LEN: usize = 1600;

#[derive(Deserialize)]
pub struct SmsCommand {
    /// Host device to send through.
    pub to_device_id: i64,
    /// SIM slot (1 or 2).
    pub sim: i64,
    /// Phone number.
    pub to: String,
    pub body: String,
}

#[derive(Deserialize)]
pub struct CallCommand {
    pub to_device_id: i64,
    pub sim: i64,
    pub to: String,
}

fn validate_sim(sim: i64) -> Result<(), ApiError> {
    if sim == 1 || sim == 2 {
        Ok(())
    } else {
        Err(ApiError::BadRequest("sim must be 1 or 2".to_string()))
    }
}

fn validate_recipient(to: &str) -> Result<(), ApiError> {
    let len = to.chars().count();
    if len == 0 || len > MAX_RECIPIENT_LEN {
        return Err(ApiError::BadRequest(format!(
            "to must be 1-{MAX_RECIPIENT_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_body(body: &str) -> Result<(), ApiError> {
    let len = body.chars().count();
    if len == 0 || len > MAX_SMS_BODY_LEN {
        return Err(ApiError::BadRequest(format!(
            "body must be 1-{MAX_SMS_BODY_LEN} characters"
        )));
    }
    Ok(())
}

async fn relay_command(
    ctx: &AppContext,
    user_id: i64,
    host_device_id: i64,
    mut payload: Map<String, Value>,
) -> Result<Json<Value>, ApiError> {
    let from_device_id = relay::resolve_http_sender(ctx, user_id, host_device_id).await?;

    match relay::relay_message(ctx, host_device_id, &mut payload, from_device_id).await? {
        RelayOutcome::Sent { req_id } => Ok(Json(json!({ "status": "sent", "req_id": req_id }))),
        RelayOutcome::Queued { req_id } => {
            Ok(Json(json!({ "status": "queued", "req_id": req_id })))
        }
        RelayOutcome::TargetOffline { .. } => Err(ApiError::DeliveryFailed),
    }
}

pub async fn send_sms(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<SmsCommand>,
) -> Result<Json<Value>, ApiError> {
    validate_sim(req.sim)?;
    validate_recipient(&req.to)?;
    validate_body(&req.body)?;

    let payload = relay::sms_command(req.sim, &req.to, &req.body);
    relay_command(&ctx, user_id, req.to_device_id, payload).await
}

pub async fn make_call(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<CallCommand>,
) -> Result<Json<Value>, ApiError> {
    validate_sim(req.sim)?;
    validate_recipient(&req.to)?;

    let payload = relay::call_command(req.sim, &req.to);
    relay_command(&ctx, user_id, req.to_device_id, payload).await
}

#[derive(Deserialize)]
pub struct SimsQuery {
    pub host_device_id: i64,
}

pub async fn get_sims(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<SimsQuery>,
) -> Result<Json<Value>, ApiError> {
    let payload = relay::sims_command();
    relay_command(&ctx, user_id, query.host_device_id, payload).await
}
