//! HTTP surface: JSON API over the supervisor plus a WebSocket event feed.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::TriageConfig;
use crate::orchestrator::{SessionEvent, build_supervisor};
use api::AppState;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

/// Run the server until Ctrl+C.
pub async fn start_server(config: &TriageConfig) -> Result<()> {
    let (events, _rx) = broadcast::channel::<SessionEvent>(256);
    let supervisor = build_supervisor(config, Some(events.clone()))?;
    let state = Arc::new(AppState { supervisor, events });
    let app = build_router(state, &config.toml.server.cors_origins);

    let addr = format!("{}:{}", config.toml.server.host, config.toml.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        address = %local_addr,
        store = %config.store_path().display(),
        "server listening"
    );
    println!("labtriage listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
