use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 8100;
const DEFAULT_DB_PATH: &str = "simbridge.db";
const DEFAULT_TOKEN_EXPIRY_HOURS: i64 = 24;
const DEFAULT_LOG_RETENTION_DAYS: u32 = 90;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// Optional config file (`--config` / `SIMBRIDGE_CONFIG`) — all fields are
/// overrides. Priority: CLI / env var  >  TOML  >  built-in default.
///
/// Secrets (`JWT_SECRET`, `GOOGLE_CLIENT_ID`) are environment-only and never
/// read from the file.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP + WebSocket listen port (default: 8100).
    port: Option<u16>,
    /// SQLite database path (default: simbridge.db).
    db_path: Option<PathBuf>,
    /// Log level filter string, e.g. "debug", "info,simbridged=trace".
    log: Option<String>,
    /// Bearer token lifetime in hours (default: 24).
    token_expiry_hours: Option<i64>,
    /// How many days of message logs to keep (default: 90).
    log_retention_days: Option<u32>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── ServerConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub log: String,
    /// HS256 signing secret for bearer tokens (JWT_SECRET env var, required).
    pub jwt_secret: String,
    /// Google OAuth client id. None disables `/auth/google` (501).
    pub google_client_id: Option<String>,
    /// Bearer token lifetime in hours.
    pub token_expiry_hours: i64,
    /// Message logs older than this many days are purged at startup.
    pub log_retention_days: u32,
}

impl ServerConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file named by `config_path`
    ///   3. Built-in defaults
    ///
    /// Fails when `JWT_SECRET` is unset or empty — the relay must not start
    /// with an unauthenticated token surface.
    pub fn new(
        port: Option<u16>,
        db_path: Option<PathBuf>,
        log: Option<String>,
        config_path: Option<&Path>,
    ) -> Result<Self> {
        let toml = config_path.and_then(load_toml).unwrap_or_default();

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => bail!("JWT_SECRET environment variable is required"),
        };

        let google_client_id = std::env::var("GOOGLE_CLIENT_ID")
            .ok()
            .filter(|v| !v.is_empty());

        let token_expiry_hours = std::env::var("TOKEN_EXPIRY_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(toml.token_expiry_hours)
            .unwrap_or(DEFAULT_TOKEN_EXPIRY_HOURS);

        let log_retention_days = std::env::var("LOG_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(toml.log_retention_days)
            .unwrap_or(DEFAULT_LOG_RETENTION_DAYS);

        Ok(Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            db_path: db_path
                .or(toml.db_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            jwt_secret,
            google_client_id,
            token_expiry_hours,
            log_retention_days,
        })
    }
}
