//! Meshgate server - WebSocket and REST front end for the gateway
//!
//! - `/ws` turns each socket into a [`BroadcastHub`](meshgate_core::BroadcastHub)
//!   subscriber
//! - `/api/*` is a thin command surface over the device session and the
//!   message history
//!
//! The `meshgate` binary wires a [`ProcessDriver`](meshgate_core::ProcessDriver)
//! and a [`SqliteStore`](meshgate_state::SqliteStore) into a
//! [`Gateway`] and serves [`create_router`].

pub mod config;
pub mod server;

use meshgate_core::Gateway;
use std::sync::Arc;
use std::time::Instant;

pub use config::{NodeConfig, ServerConfig};
pub use server::create_router;

/// Application state shared across handlers
pub struct AppState {
    /// The running gateway
    pub gateway: Arc<Gateway>,
    /// Process start time
    pub start_time: Instant,
}

impl AppState {
    /// Wrap a gateway
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            start_time: Instant::now(),
        }
    }
}
