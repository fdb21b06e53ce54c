//! HTTP server
//!
//! WebSocket subscriptions plus the REST command surface.

pub mod rest;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::AppState;

/// Create the server router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(rest::health))
        // WebSocket endpoint
        .route("/ws", get(websocket::ws_handler))
        // Connection
        .route("/api/connect", post(rest::connect))
        .route("/api/disconnect", post(rest::disconnect))
        .route("/api/status", get(rest::status))
        // Device queries
        .route("/api/nodes", get(rest::list_nodes))
        .route("/api/node/:id", get(rest::get_node))
        .route("/api/channels", get(rest::list_channels))
        .route("/api/config", get(rest::get_config))
        // Commands
        .route("/api/message", post(rest::send_message))
        .route("/api/traceroute/:id", post(rest::traceroute))
        // History
        .route("/api/messages", get(rest::get_messages))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
