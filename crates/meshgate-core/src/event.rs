//! Domain events delivered to subscribers
//!
//! Every event serializes as an envelope `{"type": ..., "data": {...}}`.
//! Payloads hold only plain, already-decoded fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::Node;

/// Serialized keepalive frame sent to idle subscribers
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// How the device is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// USB/serial device path
    Serial,
    /// host:port over TCP
    #[serde(alias = "tcp")]
    Network,
}

impl ConnectionType {
    /// Settings/wire name of this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Serial => "serial",
            ConnectionType::Network => "network",
        }
    }

    /// Parse a stored or requested mode
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "serial" => Some(ConnectionType::Serial),
            "network" | "tcp" => Some(ConnectionType::Network),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Sent, waiting for the mesh to acknowledge
    Pending,
    /// Inbound message
    Received,
    /// Positively acknowledged
    Ack,
    /// Negatively acknowledged
    Nak,
}

impl AckStatus {
    /// Storage name of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Pending => "pending",
            AckStatus::Received => "received",
            AckStatus::Ack => "ack",
            AckStatus::Nak => "nak",
        }
    }

    /// Parse a stored status
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(AckStatus::Pending),
            "received" => Some(AckStatus::Received),
            "ack" => Some(AckStatus::Ack),
            "nak" => Some(AckStatus::Nak),
            _ => None,
        }
    }
}

/// Connection state snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether a device link is open
    pub connected: bool,
    /// Mode of the current (or last attempted) link
    pub connection_type: Option<ConnectionType>,
    /// Device path or host:port
    pub address: Option<String>,
    /// Own node id (`!xxxxxxxx`)
    pub my_node_id: Option<String>,
    /// Own node number
    pub my_node_num: Option<u32>,
    /// Present while a lost link is being handled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnecting: Option<bool>,
}

/// Acknowledgment for a previously sent packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEvent {
    /// Correlation id (request id of the routing packet)
    pub packet_id: u32,
    /// `ack` or `nak`
    pub status: AckStatus,
    /// Routing error reason for a `nak`
    pub error: Option<String>,
}

/// Inbound text message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Packet id
    pub packet_id: Option<u32>,
    /// Sender node id
    pub sender: String,
    /// Receiver node id; `None` for broadcast
    pub receiver: Option<String>,
    /// Channel index
    pub channel: u32,
    /// Message text
    pub text: String,
    /// Receive time (unix seconds)
    pub timestamp: Option<i64>,
    /// Receive SNR
    pub snr: Option<f64>,
    /// Remaining hop limit
    pub hop_limit: Option<u32>,
}

/// Route discovered by a traceroute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteEvent {
    /// Id of the traceroute request this answers
    pub request_id: Option<u32>,
    /// Responding node id
    pub from: Option<String>,
    /// Intermediate hops towards the destination
    pub route: Vec<u32>,
    /// Intermediate hops on the way back
    pub route_back: Vec<u32>,
    /// Per-hop SNR towards the destination
    pub snr_towards: Vec<Value>,
    /// Per-hop SNR on the way back
    pub snr_back: Vec<Value>,
}

/// Position report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    /// Reporting node id
    pub from: Option<String>,
    /// Latitude in degrees
    pub latitude: Option<f64>,
    /// Longitude in degrees
    pub longitude: Option<f64>,
    /// Altitude in meters
    pub altitude: Option<f64>,
    /// Fix time (unix seconds)
    pub time: Option<i64>,
}

/// Telemetry report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Reporting node id
    pub from: Option<String>,
    /// Device metrics block
    pub device_metrics: Option<Value>,
    /// Environment metrics block
    pub environment_metrics: Option<Value>,
}

/// A normalized device occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Link state changed or snapshot for a new subscriber
    ConnectionStatus(ConnectionStatus),
    /// Acknowledgment arrived
    Ack(AckEvent),
    /// Text message arrived
    Message(MessageEvent),
    /// Traceroute response arrived
    Traceroute(TracerouteEvent),
    /// Position report arrived
    Position(PositionEvent),
    /// Telemetry report arrived
    Telemetry(TelemetryEvent),
    /// Node database entry changed
    NodeUpdate(Node),
}

impl DomainEvent {
    /// Envelope `type` of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ConnectionStatus(_) => "connection_status",
            DomainEvent::Ack(_) => "ack",
            DomainEvent::Message(_) => "message",
            DomainEvent::Traceroute(_) => "traceroute",
            DomainEvent::Position(_) => "position",
            DomainEvent::Telemetry(_) => "telemetry",
            DomainEvent::NodeUpdate(_) => "node_update",
        }
    }

    /// Serialize into the subscriber envelope
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
