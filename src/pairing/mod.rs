//! Pairing state machine: code issuance for a host, confirmation from a
//! client, same-owner enforcement.
//!
//! Codes are 6 decimal digits from OS entropy, live for 10 minutes, and are
//! single-use. Issuing a new code atomically invalidates any unused
//! predecessor for the same host, so at most one live code exists per host.

use chrono::{Duration, Utc};
use rand::{rngs::OsRng, Rng};

use crate::error::ApiError;
use crate::storage::DeviceRole;
use crate::AppContext;

pub const CODE_TTL_SECONDS: i64 = 600;

pub struct IssuedCode {
    pub code: String,
    pub expires_in_seconds: i64,
}

pub enum ConfirmOutcome {
    Paired {
        pairing_id: i64,
        host_device_id: i64,
    },
    AlreadyPaired {
        pairing_id: i64,
    },
}

fn generate_code() -> String {
    let n: u32 = OsRng.gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Issue a fresh code for `host_device_id`. The device must exist, belong
/// to the caller, and have the host role.
pub async fn issue_code(
    ctx: &AppContext,
    caller_user_id: i64,
    host_device_id: i64,
) -> Result<IssuedCode, ApiError> {
    let device = ctx.storage.get_device(host_device_id).await?;
    let valid = device
        .filter(|d| d.user_id == caller_user_id)
        .filter(|d| d.role() == Some(DeviceRole::Host));
    if valid.is_none() {
        return Err(ApiError::NotFound("Host device not found".to_string()));
    }

    let code = generate_code();
    let expires_at = (Utc::now() + Duration::seconds(CODE_TTL_SECONDS)).to_rfc3339();
    ctx.storage
        .replace_pairing_code(caller_user_id, host_device_id, &code, &expires_at)
        .await?;

    Ok(IssuedCode {
        code,
        expires_in_seconds: CODE_TTL_SECONDS,
    })
}

/// Confirm `code` against the caller's client device.
///
/// An expired-but-unused code behaves exactly like a code that never
/// existed. Codes issued by a different account are rejected with 403 even
/// when guessed correctly — ownership of both sides must coincide before a
/// pairing row is ever created.
pub async fn confirm_code(
    ctx: &AppContext,
    caller_user_id: i64,
    code: &str,
    client_device_id: i64,
) -> Result<ConfirmOutcome, ApiError> {
    ctx.limiter.check(&format!("pair:{client_device_id}"))?;

    let device = ctx.storage.get_device(client_device_id).await?;
    let valid = device
        .filter(|d| d.user_id == caller_user_id)
        .filter(|d| d.role() == Some(DeviceRole::Client));
    if valid.is_none() {
        return Err(ApiError::NotFound("Client device not found".to_string()));
    }

    let Some(pending) = ctx.storage.find_active_code(code).await? else {
        return Err(ApiError::BadRequest(
            "Invalid or expired pairing code".to_string(),
        ));
    };

    if pending.user_id != caller_user_id {
        return Err(ApiError::Forbidden(
            "Pairing code belongs to a different account".to_string(),
        ));
    }

    if let Some(existing) = ctx
        .storage
        .find_pairing(pending.host_device_id, client_device_id)
        .await?
    {
        ctx.storage.mark_code_used(pending.id).await?;
        return Ok(ConfirmOutcome::AlreadyPaired {
            pairing_id: existing.id,
        });
    }

    let pairing_id = ctx
        .storage
        .consume_code_and_pair(pending.id, pending.host_device_id, client_device_id)
        .await?;

    Ok(ConfirmOutcome::Paired {
        pairing_id,
        host_device_id: pending.host_device_id,
    })
}
