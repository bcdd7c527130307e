//! Identity: registration, password + Google login, bearer token mint and
//! verification, and the request extractor handlers use to resolve the
//! caller.

pub mod google;
pub mod rate_limit;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::storage::UserRow;
use crate::AppContext;

use google::GoogleIdentity;

// ─── Password hashing ────────────────────────────────────────────────────────

/// Argon2id with default parameters and a fresh random salt; output is a
/// PHC string safe to store as-is.
pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(password_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

// ─── Bearer tokens ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub iat: i64,
    pub exp: i64,
}

pub fn mint_token(secret: &str, user_id: i64, expiry_hours: i64) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        user_id,
        iat: now.timestamp(),
        exp: (now + Duration::hours(expiry_hours)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("token encoding failed: {e}")))
}

/// Yields the `user_id` the token was minted for, or 401.
pub fn verify_token(secret: &str, token: &str) -> Result<i64, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            ApiError::Unauthorized("Token expired".to_string())
        }
        _ => ApiError::Unauthorized("Invalid token".to_string()),
    })?;
    Ok(data.claims.user_id)
}

// ─── Request extractor ───────────────────────────────────────────────────────

/// The authenticated caller, resolved from `Authorization: Bearer <token>`.
pub struct AuthUser(pub i64);

impl FromRequestParts<Arc<AppContext>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppContext>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;
        let user_id = verify_token(&state.config.jwt_secret, token)?;
        Ok(AuthUser(user_id))
    }
}

// ─── Account operations ──────────────────────────────────────────────────────

pub async fn register(ctx: &AppContext, username: &str, password: &str) -> Result<UserRow, ApiError> {
    if ctx
        .storage
        .find_user_by_username(username)
        .await?
        .is_some()
    {
        return Err(ApiError::BadRequest("Username already taken".to_string()));
    }
    let hash = hash_password(password)?;
    let user = ctx
        .storage
        .create_user(username, Some(&hash), None, None)
        .await?;
    Ok(user)
}

/// Rate-limited per username. Accounts created via Google carry no password
/// hash and always fail here.
pub async fn login(
    ctx: &AppContext,
    username: &str,
    password: &str,
) -> Result<(String, i64), ApiError> {
    ctx.limiter.check(username)?;

    let user = ctx.storage.find_user_by_username(username).await?;
    let Some(user) = user else {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    };
    let Some(hash) = user.password_hash.as_deref() else {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    };
    if !verify_password(password, hash) {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let token = mint_token(&ctx.config.jwt_secret, user.id, ctx.config.token_expiry_hours)?;
    Ok((token, user.id))
}

/// Verify the ID token, then match in order: by `google_id`, by `email`
/// (linking the Google account to the existing user), else create a fresh
/// user with a derived unique username.
pub async fn google_login(ctx: &AppContext, id_token: &str) -> Result<(String, i64), ApiError> {
    let verifier = ctx
        .google
        .as_ref()
        .ok_or_else(|| ApiError::NotConfigured("Google login is not configured".to_string()))?;

    let identity = verifier.verify(id_token).await?;

    if let Some(user) = ctx.storage.find_user_by_google_id(&identity.subject).await? {
        let token = mint_token(&ctx.config.jwt_secret, user.id, ctx.config.token_expiry_hours)?;
        return Ok((token, user.id));
    }

    if let Some(email) = identity.email.as_deref() {
        if let Some(user) = ctx.storage.find_user_by_email(email).await? {
            ctx.storage.link_google_id(user.id, &identity.subject).await?;
            let token = mint_token(&ctx.config.jwt_secret, user.id, ctx.config.token_expiry_hours)?;
            return Ok((token, user.id));
        }
    }

    let username = unique_username(ctx, &derive_username_base(&identity)).await?;
    let user = ctx
        .storage
        .create_user(
            &username,
            None,
            identity.email.as_deref(),
            Some(&identity.subject),
        )
        .await?;
    let token = mint_token(&ctx.config.jwt_secret, user.id, ctx.config.token_expiry_hours)?;
    Ok((token, user.id))
}

fn derive_username_base(identity: &GoogleIdentity) -> String {
    identity
        .email
        .as_deref()
        .and_then(|e| e.split('@').next())
        .filter(|local| !local.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let prefix: String = identity.subject.chars().take(8).collect();
            format!("google_{prefix}")
        })
}

/// `base`, then `base1`, `base2`, … — first name the store does not know.
async fn unique_username(ctx: &AppContext, base: &str) -> Result<String, ApiError> {
    if ctx.storage.find_user_by_username(base).await?.is_none() {
        return Ok(base.to_string());
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}{n}");
        if ctx.storage.find_user_by_username(&candidate).await?.is_none() {
            return Ok(candidate);
        }
        n += 1;
    }
}
