use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth;
use crate::error::ApiError;
use crate::AppContext;

#[derive(Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

pub async fn register(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<AuthRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = auth::register(&ctx, &req.username, &req.password).await?;
    Ok(Json(json!({ "id": user.id, "username": user.username })))
}

pub async fn login(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<AuthRequest>,
) -> Result<Json<Value>, ApiError> {
    let (token, user_id) = auth::login(&ctx, &req.username, &req.password).await?;
    Ok(Json(json!({ "token": token, "user_id": user_id })))
}

#[derive(Deserialize)]
pub struct GoogleAuthRequest {
    pub id_token: String,
}

pub async fn google(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<GoogleAuthRequest>,
) -> Result<Json<Value>, ApiError> {
    let (token, user_id) = auth::google_login(&ctx, &req.id_token).await?;
    Ok(Json(json!({ "token": token, "user_id": user_id })))
}
