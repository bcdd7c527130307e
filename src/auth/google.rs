//! Google ID-token verification.
//!
//! The trait seam exists so the HTTP handlers never know whether they are
//! talking to Google or to a test stub. The production implementation calls
//! the tokeninfo endpoint, which validates the signature server-side; we
//! still check `aud` against our own client id so tokens minted for other
//! apps are rejected.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ApiError;

const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// The subset of a verified ID token the identity layer cares about.
#[derive(Debug, Clone)]
pub struct GoogleIdentity {
    /// Google's stable account id (`sub` claim).
    pub subject: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, ApiError>;
}

#[derive(Deserialize)]
struct TokenInfo {
    aud: String,
    sub: String,
    email: Option<String>,
}

pub struct GoogleTokenVerifier {
    http: reqwest::Client,
    client_id: String,
}

impl GoogleTokenVerifier {
    pub fn new(client_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id,
        }
    }
}

#[async_trait]
impl IdTokenVerifier for GoogleTokenVerifier {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, ApiError> {
        let resp = self
            .http
            .get(TOKENINFO_URL)
            .query(&[("id_token", id_token)])
            .send()
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;

        if !resp.status().is_success() {
            return Err(ApiError::Unauthorized("Invalid Google token".to_string()));
        }

        let info: TokenInfo = resp
            .json()
            .await
            .map_err(|_| ApiError::Unauthorized("Invalid Google token".to_string()))?;

        if info.aud != self.client_id {
            return Err(ApiError::Unauthorized("Invalid Google token".to_string()));
        }

        Ok(GoogleIdentity {
            subject: info.sub,
            email: info.email,
        })
    }
}
