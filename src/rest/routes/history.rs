use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::AppContext;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub device_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Paginated message log for the caller's devices, newest first. A
/// `device_id` filter is honored only when the device belongs to the
/// caller; foreign ids are silently ignored rather than leaking existence.
pub async fn get_history(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(0, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let device_filter = match query.device_id {
        Some(device_id) => ctx
            .storage
            .get_device(device_id)
            .await?
            .filter(|d| d.user_id == user_id)
            .map(|d| d.id),
        None => None,
    };

    let (rows, total) = ctx
        .storage
        .history(user_id, device_filter, limit, offset)
        .await?;

    let items: Vec<Value> = rows
        .iter()
        .map(|log| {
            // Payloads are stored as JSON text; hand them back structured.
            let payload = serde_json::from_str::<Value>(&log.payload)
                .unwrap_or_else(|_| Value::String(log.payload.clone()));
            json!({
                "id": log.id,
                "from_device_id": log.from_device_id,
                "to_device_id": log.to_device_id,
                "msg_kind": log.msg_kind,
                "payload": payload,
                "created_at": log.created_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "items": items,
        "total": total,
        "offset": offset,
        "limit": limit,
    })))
}
