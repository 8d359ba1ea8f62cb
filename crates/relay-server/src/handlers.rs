//! HTTP and WebSocket handlers for the Relay server.
//!
//! This module wires the hub to its publisher, the axum routes and the
//! process signals.

use crate::config::Config;
use crate::metrics;
use crate::sources;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tenvis_relay_core::{has_token, metadata_from_params, ChannelPublisher, Hub, Termination};
use tenvis_relay_transport::websocket::{WebSocketConfig, WebSocketTransport};
use tenvis_relay_transport::AxumConnection;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The broadcast hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(hub: Arc<Hub>, config: Config) -> Self {
        Self { hub, config }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let publisher = ChannelPublisher::new("relay");
    sources::spawn_sources(&publisher, &config.streams, config.limits.stream_buffer)
        .context("Failed to register demo streams")?;

    let hub = Arc::new(
        Hub::new(Arc::new(publisher), config.hub_config())
            .with_writer(config.transport.format.writer()),
    );
    let streams = hub.start().context("Failed to start streams")?;
    info!(streams = ?streams, "Streams started");

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(&config.host, config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    install_shutdown_handler(Arc::clone(&hub));

    if let Some(port) = config.transport.standalone_port {
        let bind_addr = SocketAddr::new(config.bind_addr()?.ip(), port);
        let transport = WebSocketTransport::new(WebSocketConfig {
            bind_addr,
            max_message_size: config.limits.max_message_size,
        })
        .await
        .with_context(|| format!("Failed to bind standalone listener on {}", bind_addr))?;
        tokio::spawn(Arc::clone(&hub).serve(transport));
    }

    let state = Arc::new(AppState::new(hub, config.clone()));
    let app = router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route(
            "/streams",
            get(streams_handler).layer(CorsLayer::new().allow_origin(Any)),
        )
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.connection_count(),
    }))
}

/// Stream catalog handler.
async fn streams_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "publisher": state.hub.publisher().name(),
        "streams": state.hub.stream_names(),
    }))
}

/// WebSocket upgrade handler.
///
/// Query parameters become the connection's metadata.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let meta = metadata_from_params(params);
    if state.hub.config().require_token && !has_token(&meta) {
        warn!(remote = %addr, "Rejecting upgrade without token");
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    }

    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let connection = AxumConnection::new(socket, Some(addr), max_message_size);
            match state.hub.connect(Box::new(connection), meta) {
                Ok(client) => debug!(client = %client.id(), "WebSocket upgraded"),
                Err(e) => warn!(remote = %addr, error = %e, "Connection refused"),
            }
        })
}

/// Terminate every connection and exit on SIGINT or SIGTERM.
fn install_shutdown_handler(hub: Arc<Hub>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received");
        hub.shutdown(Termination::Shutdown);
        std::process::exit(1);
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
