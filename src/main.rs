use anyhow::Result;
use clap::{Parser, Subcommand};
use simbridged::{
    auth::google::{GoogleTokenVerifier, IdTokenVerifier},
    auth::rate_limit::RateLimiter,
    config::ServerConfig,
    registry::SessionRegistry,
    rest,
    storage::Storage,
    AppContext,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "simbridged",
    about = "SimBridge Relay — routes telephony commands between paired devices",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP + WebSocket listen port
    #[arg(long, env = "SIMBRIDGE_PORT")]
    port: Option<u16>,

    /// SQLite database path
    #[arg(long, env = "DB_PATH")]
    db_path: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SIMBRIDGE_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "SIMBRIDGE_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Optional TOML config file with non-secret overrides
    #[arg(long, env = "SIMBRIDGE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the relay server (default when no subcommand given).
    ///
    /// Runs simbridged in the foreground. Requires the JWT_SECRET
    /// environment variable.
    ///
    /// Examples:
    ///   simbridged serve
    ///   simbridged
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        None | Some(Command::Serve) => {
            run_server(args.port, args.db_path, args.log, args.config).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("simbridged.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

async fn run_server(
    port: Option<u16>,
    db_path: Option<std::path::PathBuf>,
    log: Option<String>,
    config_path: Option<std::path::PathBuf>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "simbridged starting");

    let config = Arc::new(ServerConfig::new(
        port,
        db_path,
        log,
        config_path.as_deref(),
    )?);
    info!(
        db_path = %config.db_path.display(),
        port = config.port,
        retention_days = config.log_retention_days,
        "config loaded"
    );

    let storage = Arc::new(Storage::new(&config.db_path).await?);

    // Retention pass runs once per process start; a failure is not fatal.
    match storage.purge_old_logs(config.log_retention_days).await {
        Ok(0) => {}
        Ok(n) => info!(purged = n, days = config.log_retention_days, "purged old message logs"),
        Err(e) => warn!(err = %e, "message log purge failed"),
    }

    let google: Option<Arc<dyn IdTokenVerifier>> = match config.google_client_id.clone() {
        Some(client_id) => {
            info!("Google login enabled");
            Some(Arc::new(GoogleTokenVerifier::new(client_id)))
        }
        None => {
            warn!("GOOGLE_CLIENT_ID not set — /auth/google will return 501");
            None
        }
    };

    let ctx = Arc::new(AppContext {
        config,
        storage,
        registry: Arc::new(SessionRegistry::new()),
        limiter: Arc::new(RateLimiter::new()),
        google,
        started_at: std::time::Instant::now(),
    });

    rest::serve(ctx).await
}
