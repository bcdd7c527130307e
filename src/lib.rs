pub mod auth;
pub mod config;
pub mod error;
pub mod pairing;
pub mod registry;
pub mod relay;
pub mod rest;
pub mod storage;
pub mod ws;

use std::sync::Arc;

use auth::google::IdTokenVerifier;
use auth::rate_limit::RateLimiter;
use config::ServerConfig;
use registry::SessionRegistry;
use storage::Storage;

/// Shared application state passed to every HTTP handler and session task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub storage: Arc<Storage>,
    /// Process-local map of live sessions — the single source of truth for
    /// `is_online` and for relay routing.
    pub registry: Arc<SessionRegistry>,
    /// Sliding-window limiter shared by login (keyed by username) and
    /// pairing confirmation (keyed by `pair:<client_device_id>`).
    pub limiter: Arc<RateLimiter>,
    /// ID-token verifier for `/auth/google`. `None` when no client id is
    /// configured; the endpoint then answers 501.
    pub google: Option<Arc<dyn IdTokenVerifier>>,
    pub started_at: std::time::Instant,
}
