use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::pairing::{self, ConfirmOutcome};
use crate::AppContext;

#[derive(Deserialize)]
pub struct PairQuery {
    pub host_device_id: i64,
}

pub async fn create_pairing_code(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<PairQuery>,
) -> Result<Json<Value>, ApiError> {
    let issued = pairing::issue_code(&ctx, user_id, query.host_device_id).await?;
    Ok(Json(json!({
        "code": issued.code,
        "expires_in_seconds": issued.expires_in_seconds,
    })))
}

#[derive(Deserialize)]
pub struct PairConfirm {
    pub code: String,
    pub client_device_id: i64,
}

pub async fn confirm_pairing(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<PairConfirm>,
) -> Result<Json<Value>, ApiError> {
    match pairing::confirm_code(&ctx, user_id, &req.code, req.client_device_id).await? {
        ConfirmOutcome::Paired {
            pairing_id,
            host_device_id,
        } => Ok(Json(json!({
            "status": "paired",
            "pairing_id": pairing_id,
            "host_device_id": host_device_id,
        }))),
        ConfirmOutcome::AlreadyPaired { pairing_id } => Ok(Json(json!({
            "status": "already_paired",
            "pairing_id": pairing_id,
        }))),
    }
}
