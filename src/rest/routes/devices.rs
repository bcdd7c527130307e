use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::storage::DeviceRole;
use crate::AppContext;

#[derive(Deserialize)]
pub struct DeviceCreate {
    pub name: String,
    /// "host" or "client". Immutable after creation.
    #[serde(rename = "type")]
    pub device_type: String,
}

pub async fn create_device(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<DeviceCreate>,
) -> Result<Json<Value>, ApiError> {
    let Some(role) = DeviceRole::parse(&req.device_type) else {
        return Err(ApiError::BadRequest(
            "type must be 'host' or 'client'".to_string(),
        ));
    };
    let device = ctx.storage.create_device(user_id, &req.name, role).await?;
    Ok(Json(json!({
        "id": device.id,
        "name": device.name,
        "type": device.device_type,
        "is_online": false,
    })))
}

/// `is_online` is computed from the session registry at call time; it is
/// never persisted.
pub async fn list_devices(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let devices = ctx.storage.list_devices(user_id).await?;
    let mut out = Vec::with_capacity(devices.len());
    for device in devices {
        let is_online = ctx.registry.is_online(device.id).await;
        out.push(json!({
            "id": device.id,
            "name": device.name,
            "type": device.device_type,
            "is_online": is_online,
            "last_seen": device.last_seen_at,
        }));
    }
    Ok(Json(Value::Array(out)))
}
