//! Error types for gateway operations
//!
//! This module provides error handling for the device session, the
//! radio driver boundary, the event bridge and subscriber delivery.

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Connection Errors =====
    /// Opening the device link failed
    #[error("Failed to open {target}: {reason}")]
    OpenFailed {
        /// Serial path or host:port that was attempted
        target: String,
        /// Failure reason
        reason: String,
    },

    /// Address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A command needs a live device link
    #[error("Not connected to a device")]
    NotConnected,

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Device link reported an error while executing a command
    #[error("Device link error: {0}")]
    Link(String),

    /// The caller's wait for traceroute initiation expired
    #[error("Traceroute initiation timed out after {duration_ms}ms")]
    TracerouteTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Packet Errors =====
    /// Packet did not have the expected shape
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    // ===== Bridge / Delivery Errors =====
    /// Event-processing context has not started yet
    #[error("Event bridge is not running")]
    BridgeNotRunning,

    /// Too many units of work are outstanding
    #[error("Event bridge registry full ({capacity} in flight)")]
    BridgeSaturated {
        /// Registry capacity
        capacity: usize,
    },

    /// Subscriber transport is closed or failed to send
    #[error("Subscriber transport failed: {0}")]
    Transport(String),

    /// Persistence gateway failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectionTimeout { .. }
                | GatewayError::TracerouteTimeout { .. }
                | GatewayError::BridgeNotRunning
                | GatewayError::BridgeSaturated { .. }
        )
    }

    /// Check if this error came from the device side of the boundary
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            GatewayError::OpenFailed { .. }
                | GatewayError::ConnectionTimeout { .. }
                | GatewayError::Link(_)
                | GatewayError::MalformedPacket(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::OpenFailed { .. } => "OPEN_FAILED",
            GatewayError::InvalidAddress(_) => "INVALID_ADDRESS",
            GatewayError::NotConnected => "NOT_CONNECTED",
            GatewayError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            GatewayError::Link(_) => "LINK_ERROR",
            GatewayError::TracerouteTimeout { .. } => "TRACEROUTE_TIMEOUT",
            GatewayError::MalformedPacket(_) => "MALFORMED_PACKET",
            GatewayError::BridgeNotRunning => "BRIDGE_NOT_RUNNING",
            GatewayError::BridgeSaturated { .. } => "BRIDGE_SATURATED",
            GatewayError::Transport(_) => "TRANSPORT_ERROR",
            GatewayError::Persistence(_) => "PERSISTENCE_ERROR",
            GatewayError::InvalidConfig(_) => "INVALID_CONFIG",
            GatewayError::ChannelClosed => "CHANNEL_CLOSED",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GatewayError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for GatewayError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        GatewayError::ChannelClosed
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::InvalidConfig(err.to_string())
    }
}
