//! Meshgate State - message history and settings storage
//!
//! This crate provides the SQLite implementation of the gateway's
//! [`PersistenceGateway`](meshgate_core::PersistenceGateway).
//!
//! ## Components
//!
//! - **storage**: SQLite-based persistence with sqlx (messages, ack status, settings)
//! - **error**: Storage-specific error types
//!
//! ## Example
//!
//! ```ignore
//! use meshgate_state::SqliteStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteStore::new("meshgate.db").await?);
//!     let gateway = Gateway::start(config, driver, Some(store));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;

pub use error::{Result, StateError};
pub use storage::SqliteStore;
