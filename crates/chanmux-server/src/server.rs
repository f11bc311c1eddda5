use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chanmux_core::{JsonRouter, MessageRouter};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection::WsConnection;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionConfig};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    /// Channels registered on every connection's router; all are echoed.
    pub channels: Vec<String>,
    pub queue_capacity: usize,
    pub error_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            channels: vec!["dp".into()],
            queue_capacity: 20,
            error_capacity: 20,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve in the background. Returns a handle to shut it down.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SessionRegistry::new());
    let addr = format!("{}:{}", config.host, config.port);

    let state = AppState {
        config: Arc::new(config),
        registry: Arc::clone(&registry),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(port = local_addr.port(), "Server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop accepting, stop all sessions (late upgrades are refused by the
    /// registry), then wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.registry.stop_all().await;
        let _ = self.server.await;
        tracing::info!("Server stopped");
    }
}

/// WebSocket upgrade handler. A failed upgrade never creates a session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Echo application: every payload arriving on a configured channel is
/// written back to the client unchanged.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let config = &state.config;
    let router = JsonRouter::new(config.channels.iter().cloned(), config.queue_capacity);
    for name in &config.channels {
        router.get(name).set_flow(true);
    }

    let (session, mut errors) = Session::new(
        Arc::new(router),
        SessionConfig {
            error_capacity: config.error_capacity,
        },
    );
    if let Err(e) = session.open(Arc::new(WsConnection::new(socket))) {
        tracing::warn!(error = %e, "Failed to open session");
        return;
    }
    if !state.registry.insert(session.clone()) {
        tracing::info!(session_id = %session.id(), "Server shutting down, closing new session");
        session.stop().await;
        return;
    }

    let forwarders: Vec<_> = config
        .channels
        .iter()
        .map(|name| tokio::spawn(echo_channel(session.clone(), name.clone())))
        .collect();

    loop {
        tokio::select! {
            report = errors.recv() => match report {
                Some(e) if e.is_fatal() => {
                    tracing::info!(session_id = %session.id(), reason = %e, "Client disconnected");
                    break;
                }
                Some(e) => {
                    tracing::warn!(
                        session_id = %session.id(),
                        error = %e,
                        "Dropped inbound message"
                    );
                }
                None => break,
            },
            _ = session.closed() => break,
        }
    }

    session.stop().await;
    for forwarder in forwarders {
        forwarder.abort();
    }
    state.registry.remove(session.id());
}

async fn echo_channel(session: Session, channel: String) {
    let queue = session.router().get(&channel);
    loop {
        let payload = queue.dequeue().await;
        if let Err(e) = session.write(payload).await {
            tracing::debug!(
                session_id = %session.id(),
                channel = %channel,
                error = %e,
                "Echo write failed"
            );
            break;
        }
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.registry.count(),
        "open": state.registry.open_count(),
        "channels": state.config.channels,
    }))
}
