// rest/mod.rs — HTTP + WebSocket API surface.
//
// One Axum router serves everything:
//   POST /auth/register        POST /auth/login        POST /auth/google
//   POST /devices              GET  /devices
//   POST /pair                 POST /pair/confirm
//   POST /sms                  POST /call              GET  /sims
//   GET  /history
//   GET  /ws/host/{device_id}  GET  /ws/client/{device_id}

pub mod routes;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Auth (no bearer token)
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/login", post(routes::auth::login))
        .route("/auth/google", post(routes::auth::google))
        // Devices
        .route(
            "/devices",
            post(routes::devices::create_device).get(routes::devices::list_devices),
        )
        // Pairing
        .route("/pair", post(routes::pairing::create_pairing_code))
        .route("/pair/confirm", post(routes::pairing::confirm_pairing))
        // Command relay
        .route("/sms", post(routes::commands::send_sms))
        .route("/call", post(routes::commands::make_call))
        .route("/sims", get(routes::commands::get_sims))
        // Message history
        .route("/history", get(routes::history::get_history))
        // Bidirectional sessions
        .route("/ws/host/{device_id}", get(crate::ws::ws_host))
        .route("/ws/client/{device_id}", get(crate::ws::ws_client))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "relay listening (HTTP + WebSocket on same port)");

    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relay stopped");
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
