//! Meshgate core - device session and event bridge for Meshtastic radios
//!
//! This crate connects a Meshtastic radio (serial or TCP) to any number of
//! live subscribers. It classifies device packets into typed domain events,
//! keeps the device link alive, moves events from the driver's own threads
//! into a single async processing context, and fans them out with
//! per-subscriber failure isolation and keepalive.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  callbacks  ┌──────────────┐  submit  ┌─────────────┐
//! │  RadioDriver  │────────────►│  Dispatcher  │─────────►│ EventBridge │
//! │ (own threads) │             │  (classify)  │          └──────┬──────┘
//! └───────▲───────┘             └──────────────┘                 │
//!         │ open/send/close                                      ▼
//! ┌───────┴───────┐        loss notifications         ┌─────────────────┐
//! │ DeviceSession │◄──────────────────────────────────│  EventContext   │
//! │    (actor)    │                                   │ hub + persist   │
//! └───────────────┘                                   └─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshgate_core::{Gateway, GatewayConfig, ProcessDriver, ConnectionType};
//! use std::sync::Arc;
//!
//! let config = GatewayConfig::default();
//! let driver = Arc::new(ProcessDriver::new(
//!     config.driver.clone(),
//!     config.session.connect_timeout,
//! ));
//! let gateway = Gateway::start(config, driver, None);
//!
//! if gateway.connect(ConnectionType::Network, "10.0.0.5:4403").await {
//!     let nodes = gateway.session().nodes().await?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Shared types
pub mod config;
pub mod error;
pub mod event;
pub mod node;
pub mod packet;

// Device side
pub mod dispatcher;
pub mod driver;
pub mod session;

// Async side
pub mod bridge;
pub mod gateway;
pub mod hub;
pub mod persistence;

// Testing utilities
pub mod test_utils;

pub use bridge::{BridgeStats, EventBridge, WorkHandler};
pub use config::{
    BridgeConfig, DriverConfig, GatewayConfig, GatewayConfigBuilder, HubConfig, SessionConfig,
};
pub use dispatcher::{DispatchStats, PacketDispatcher, PortNum};
pub use driver::{
    ChannelInfo, LinkListener, LinkTarget, OutgoingText, ProcessDriver, RadioDriver, RadioLink,
    SubscriptionId, TracerouteRequest,
};
pub use error::{GatewayError, Result};
pub use event::{
    AckEvent, AckStatus, ConnectionStatus, ConnectionType, DomainEvent, MessageEvent,
    PositionEvent, TelemetryEvent, TracerouteEvent, PING_FRAME,
};
pub use gateway::{EventContext, Gateway};
pub use hub::{BroadcastHub, ClientTransport, SubscriberId};
pub use node::{active_channels, format_node_id, parse_node_id, Channel, ChannelRole, Node};
pub use packet::{normalize, DescribedMessage, RawValue};
pub use persistence::{
    Direction, HistoryQuery, MessageRecord, PersistOp, PersistenceGateway, DEFAULT_HISTORY_LIMIT,
    SETTING_LAST_ADDRESS, SETTING_LAST_CONNECTION_TYPE,
};
pub use session::{ConnectionState, DeviceSession, SendRequest, SessionHandle, SessionState, Work};

// Protocol constants re-exports
pub use config::{BROADCAST_ADDR, BROADCAST_NUM, DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS, MAX_HOP_LIMIT};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
