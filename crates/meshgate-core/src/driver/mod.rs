//! Radio driver capability
//!
//! The gateway does not speak the device protocol itself. It drives a
//! [`RadioDriver`], which opens links and reports what happens on them
//! through [`LinkListener`] callbacks. Callbacks run on a thread owned by
//! the driver, never on the async runtime.
//!
//! - [`ProcessDriver`] runs a helper process that wraps the vendor radio
//!   library and exchanges newline-delimited JSON with it.
//! - [`crate::test_utils::MockDriver`] is a scriptable in-memory driver.

mod process;

pub use process::ProcessDriver;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::event::ConnectionType;
use crate::packet::RawValue;

/// Where to open a link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    /// Serial device path
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`
        path: String,
    },
    /// Networked device
    Network {
        /// Host name or IP
        host: String,
        /// TCP port
        port: u16,
    },
}

impl LinkTarget {
    /// Parse `host[:port]`, using `default_port` when none is given
    pub fn parse_network(address: &str, default_port: u16) -> Result<Self> {
        use crate::error::GatewayError;

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| GatewayError::InvalidAddress(address.to_string()))?;
                (host, port)
            }
            None => (address, default_port),
        };

        if host.is_empty() {
            return Err(GatewayError::InvalidAddress(address.to_string()));
        }

        Ok(LinkTarget::Network {
            host: host.to_string(),
            port,
        })
    }

    /// Connection mode of this target
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            LinkTarget::Serial { .. } => ConnectionType::Serial,
            LinkTarget::Network { .. } => ConnectionType::Network,
        }
    }

    /// Address as recorded in session state
    pub fn address(&self) -> String {
        match self {
            LinkTarget::Serial { path } => path.clone(),
            LinkTarget::Network { host, port } => format!("{}:{}", host, port),
        }
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.connection_type(), self.address())
    }
}

/// Channel slot as reported by the local device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Slot index
    pub index: u32,
    /// Configured name, if any
    #[serde(default)]
    pub name: Option<String>,
    /// Raw role value (0 disabled, 1 primary, 2 secondary)
    #[serde(default)]
    pub role: i32,
}

/// Outgoing text message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingText {
    /// Locally generated packet id
    pub packet_id: u32,
    /// Message body
    pub text: String,
    /// Destination node id or `^all`
    pub destination: String,
    /// Channel index
    pub channel_index: u32,
    /// Request an acknowledgment
    pub want_ack: bool,
    /// Packet id this message replies to
    pub reply_id: Option<u32>,
}

/// Traceroute request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerouteRequest {
    /// Destination node id
    pub dest: String,
    /// Hop limit
    pub hop_limit: u8,
    /// Channel index
    pub channel_index: u32,
}

/// Identifies a listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receives driver callbacks
///
/// Called on the driver's own thread. Implementations must return
/// quickly and must not panic.
pub trait LinkListener: Send + Sync {
    /// A decoded packet arrived
    fn on_packet(&self, packet: RawValue);

    /// The link finished its handshake
    fn on_connection_established(&self);

    /// The link dropped
    fn on_connection_lost(&self);

    /// A node database entry changed
    fn on_node_updated(&self, node: RawValue);

    /// The device reported its own node number
    ///
    /// May arrive before or after `open` returns.
    fn on_my_info(&self, _my_node_num: u32) {}
}

/// An open device link
///
/// All methods may block on I/O.
pub trait RadioLink: Send {
    /// Own node number, once known
    fn my_node_num(&self) -> Option<u32>;

    /// Current node database
    fn nodes(&self) -> Vec<RawValue>;

    /// Local channel table
    fn channels(&self) -> Vec<ChannelInfo>;

    /// Device and module configuration, `{}` until the device reports it
    fn config(&self) -> Value;

    /// Queue a text message
    fn send_text(&mut self, message: &OutgoingText) -> Result<()>;

    /// Start a traceroute
    fn send_traceroute(&mut self, request: &TracerouteRequest) -> Result<()>;

    /// Close the link
    fn close(&mut self) -> Result<()>;
}

/// Opens device links and feeds listeners
pub trait RadioDriver: Send + Sync {
    /// Register a listener for packets and link notifications
    fn subscribe(&self, listener: Arc<dyn LinkListener>) -> SubscriptionId;

    /// Remove a listener; unknown ids are ignored
    fn unsubscribe(&self, id: SubscriptionId);

    /// Open a link; may deliver queued events to listeners before returning
    fn open(&self, target: &LinkTarget) -> Result<Box<dyn RadioLink>>;

    /// Driver name for logging
    fn name(&self) -> &str;
}
