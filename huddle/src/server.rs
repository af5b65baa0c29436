//! Server lifecycle management
//!
//! Builds the HTTP router (signaling WebSocket, health, stats), serves it and
//! decides how the process ends: gracefully on a signal, or with an error
//! when the media engine is lost.

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use huddle_sfu::{SessionCoordinator, SessionStats};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::signaling;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub max_message_size: usize,
    /// Cancelled when the server starts shutting down, for any reason
    pub closing: CancellationToken,
}

/// How the server stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Signal,
    EngineLost,
}

pub fn create_router(state: AppState, cors_allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/ws", get(signaling::websocket_handler))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .layer(cors_layer(cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.coordinator.shutdown_token().is_cancelled() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    }
}

async fn stats(State(state): State<AppState>) -> Json<SessionStats> {
    Json(state.coordinator.stats())
}

/// Serve until a shutdown signal arrives or the media engine dies
pub async fn run(config: &Config, coordinator: Arc<SessionCoordinator>) -> anyhow::Result<Exit> {
    let addr: SocketAddr = config.http_address().parse()?;
    let engine_lost = coordinator.shutdown_token();
    let closing = engine_lost.child_token();

    let state = AppState {
        coordinator,
        max_message_size: config.server.max_message_size,
        closing: closing.clone(),
    };
    let router = create_router(state, &config.server.cors_allowed_origins);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let graceful = {
        let engine_lost = engine_lost.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => {
                    info!("Shutdown signal received, starting graceful shutdown...");
                }
                () = engine_lost.cancelled() => {
                    error!("Media engine lost, shutting down");
                }
            }
            // Open signaling sockets are not tracked by the HTTP server.
            closing.cancel();
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await?;
    info!("HTTP server shut down gracefully");

    if engine_lost.is_cancelled() {
        Ok(Exit::EngineLost)
    } else {
        Ok(Exit::Signal)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_sfu::{EngineConfig, LocalEngine, SfuConfig, TransportOptions};

    fn state() -> AppState {
        let engine_config = EngineConfig::default();
        let options = TransportOptions::from(&engine_config);
        let (engine, _events) = LocalEngine::new(engine_config);
        let coordinator = SessionCoordinator::new(SfuConfig::default(), options, engine);
        AppState {
            closing: coordinator.shutdown_token().child_token(),
            coordinator,
            max_message_size: 1024,
        }
    }

    #[tokio::test]
    async fn test_health_reports_engine_loss() {
        let state = state();
        let response = health(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.coordinator.shutdown_token().cancel();
        assert!(state.closing.is_cancelled());
        let response = health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let state = state();
        state
            .coordinator
            .connect_peer(huddle_sfu::PeerId::from("p1"))
            .unwrap();
        let Json(snapshot) = stats(State(state)).await;
        assert_eq!(snapshot.peers, 1);
        assert_eq!(snapshot.connections, 1);
    }

    #[test]
    fn test_router_builds_with_origin_list() {
        let origins = vec!["https://meet.example.com".to_string(), "not a header\n".to_string()];
        let _router = create_router(state(), &origins);
    }
}
