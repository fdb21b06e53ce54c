//! Persistence gateway
//!
//! The gateway stores text messages (both directions), their ack status and
//! a handful of settings. Storage is behind [`PersistenceGateway`]; the
//! SQLite implementation lives in `meshgate-state`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{AckStatus, MessageEvent};

/// Settings key of the last connection mode
pub const SETTING_LAST_CONNECTION_TYPE: &str = "last_connection_type";

/// Settings key of the last device address
pub const SETTING_LAST_ADDRESS: &str = "last_address";

/// Default number of messages returned by a history query
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Direction of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the mesh
    Incoming,
    /// Sent by this gateway
    Outgoing,
}

/// A stored text message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Row id, assigned by the store
    #[serde(default)]
    pub id: Option<i64>,
    /// Mesh packet id
    pub packet_id: Option<u32>,
    /// Sender node id
    pub sender: String,
    /// Receiver node id; `None` for channel broadcast
    pub receiver: Option<String>,
    /// Channel index
    pub channel: u32,
    /// Message text
    pub text: String,
    /// Incoming or outgoing
    pub direction: Direction,
    /// Delivery status
    pub ack_status: AckStatus,
    /// Unix time (seconds) the record was created
    pub timestamp: i64,
}

impl MessageRecord {
    /// Record for an inbound message
    pub fn incoming(event: &MessageEvent) -> Self {
        Self {
            id: None,
            packet_id: event.packet_id,
            sender: event.sender.clone(),
            receiver: event.receiver.clone(),
            channel: event.channel,
            text: event.text.clone(),
            direction: Direction::Incoming,
            ack_status: AckStatus::Received,
            timestamp: event.timestamp.unwrap_or_else(now_secs),
        }
    }

    /// Record for a message this gateway just sent
    pub fn outgoing(
        packet_id: u32,
        sender: impl Into<String>,
        receiver: Option<String>,
        channel: u32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            packet_id: Some(packet_id),
            sender: sender.into(),
            receiver,
            channel,
            text: text.into(),
            direction: Direction::Outgoing,
            ack_status: AckStatus::Pending,
            timestamp: now_secs(),
        }
    }
}

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Message history filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Only broadcast messages on this channel
    pub channel: Option<u32>,
    /// Only direct messages exchanged with this node
    pub dm_partner: Option<String>,
    /// Own node id, needed to resolve direct messages
    pub my_node_id: Option<String>,
    /// Maximum number of (most recent) messages
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            channel: None,
            dm_partner: None,
            my_node_id: None,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl HistoryQuery {
    /// Whether a record belongs to this query's result set
    pub fn matches(&self, record: &MessageRecord) -> bool {
        if let Some(partner) = &self.dm_partner {
            let me = self.my_node_id.as_deref();
            let from_partner = record.sender == *partner
                && (me.is_none() || record.receiver.as_deref() == me);
            let to_partner = record.receiver.as_deref() == Some(partner.as_str())
                && (me.is_none() || Some(record.sender.as_str()) == me);
            return from_partner || to_partner;
        }
        if let Some(channel) = self.channel {
            return record.channel == channel && record.receiver.is_none();
        }
        true
    }
}

/// Storage for messages and settings
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store a message, returning its row id
    async fn save_message(&self, record: &MessageRecord) -> Result<i64>;

    /// Set the ack status of the message with `packet_id`
    ///
    /// Idempotent; returns whether any record changed.
    async fn update_ack(&self, packet_id: u32, status: AckStatus) -> Result<bool>;

    /// Matching messages, oldest first, at most `query.limit` most recent
    async fn get_messages(&self, query: &HistoryQuery) -> Result<Vec<MessageRecord>>;

    /// Read a setting
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Write a setting
    async fn save_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Persistence work scheduled from outside the async context
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    /// Store a message
    SaveMessage(MessageRecord),
    /// Update a message's ack status
    UpdateAck {
        /// Packet id of the acknowledged message
        packet_id: u32,
        /// New status
        status: AckStatus,
    },
}

impl PersistOp {
    /// Run this operation against a store
    pub async fn apply(&self, store: &dyn PersistenceGateway) -> Result<()> {
        match self {
            PersistOp::SaveMessage(record) => {
                store.save_message(record).await?;
            }
            PersistOp::UpdateAck { packet_id, status } => {
                store.update_ack(*packet_id, *status).await?;
            }
        }
        Ok(())
    }
}
