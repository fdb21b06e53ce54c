//! Node and channel records
//!
//! Meshtastic identifies nodes with a 32-bit number. Its textual form is
//! `!` followed by eight lowercase hex digits (`!a1b2c3d4`). Node records
//! coming from the driver are deep-normalized into plain maps before they
//! leave this module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::ChannelInfo;
use crate::error::{GatewayError, Result};
use crate::packet::{normalize, RawValue};

/// Format a node number as a node id (`!xxxxxxxx`)
pub fn format_node_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Parse a node id in `!xxxxxxxx` form
pub fn parse_node_id(id: &str) -> Result<u32> {
    let hex = id
        .strip_prefix('!')
        .ok_or_else(|| GatewayError::InvalidAddress(id.to_string()))?;
    if hex.is_empty() || hex.len() > 8 {
        return Err(GatewayError::InvalidAddress(id.to_string()));
    }
    u32::from_str_radix(hex, 16).map_err(|_| GatewayError::InvalidAddress(id.to_string()))
}

/// A mesh node with all nested structures as plain data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Textual node id, if known
    pub id: Option<String>,
    /// Node number
    pub num: Option<u32>,
    /// User block (names, hardware model, ...)
    pub user: Option<Value>,
    /// Last known position
    pub position: Option<Value>,
    /// Signal-to-noise ratio of the last packet heard
    pub snr: Option<f64>,
    /// Unix time the node was last heard
    #[serde(rename = "lastHeard")]
    pub last_heard: Option<i64>,
    /// Battery, voltage and utilization metrics
    #[serde(rename = "deviceMetrics")]
    pub device_metrics: Option<Value>,
}

impl Node {
    /// Build a node from a driver record
    ///
    /// The id comes from the user block; when the user block carries no
    /// id it is derived from the node number.
    pub fn from_raw(raw: &RawValue) -> Self {
        let record = normalize(raw);
        let field = |name: &str| record.get(name).filter(|v| !v.is_null()).cloned();

        let user = field("user");
        let num = record
            .get("num")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        let id = user
            .as_ref()
            .and_then(|u| u.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| num.map(format_node_id));

        Self {
            id,
            num,
            user,
            position: field("position"),
            snr: record.get("snr").and_then(Value::as_f64),
            last_heard: record.get("lastHeard").and_then(Value::as_i64),
            device_metrics: field("deviceMetrics"),
        }
    }

    /// Whether `query` names this node (user id, decimal number or `!hex`)
    pub fn matches(&self, query: &str) -> bool {
        if self.id.as_deref() == Some(query) {
            return true;
        }
        match self.num {
            Some(num) => {
                num.to_string() == query || parse_node_id(query).map_or(false, |n| n == num)
            }
            None => false,
        }
    }
}

/// Role of a channel on the local device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelRole {
    /// Channel slot unused
    Disabled,
    /// Primary channel
    Primary,
    /// Secondary channel
    Secondary,
    /// Role value this gateway does not know
    Unknown,
}

impl From<i32> for ChannelRole {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Disabled,
            1 => Self::Primary,
            2 => Self::Secondary,
            _ => Self::Unknown,
        }
    }
}

/// A configured channel of the local device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel slot index
    pub index: u32,
    /// Channel name, `Channel {index}` when unset
    pub name: String,
    /// Channel role
    pub role: ChannelRole,
}

impl Channel {
    /// Build a channel from the driver's channel info
    pub fn from_info(info: &ChannelInfo) -> Self {
        let name = info
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Channel {}", info.index));

        Self {
            index: info.index,
            name,
            role: ChannelRole::from(info.role),
        }
    }
}

/// Active channels of the local device, disabled slots omitted
pub fn active_channels(infos: &[ChannelInfo]) -> Vec<Channel> {
    infos
        .iter()
        .map(Channel::from_info)
        .filter(|c| c.role != ChannelRole::Disabled)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::FakeUser;
    use serde_json::json;

    #[test]
    fn test_node_id_format() {
        assert_eq!(format_node_id(0xa1b2c3d4), "!a1b2c3d4");
        assert_eq!(format_node_id(42), "!0000002a");
        assert_eq!(parse_node_id("!0000002a").unwrap(), 42);
        assert!(parse_node_id("0000002a").is_err());
        assert!(parse_node_id("!xyz").is_err());
        assert!(parse_node_id("!").is_err());
    }

    #[test]
    fn test_node_from_plain_record() {
        let raw = RawValue::Plain(json!({
            "num": 42,
            "user": {"id": "!0000002a", "longName": "Base"},
            "snr": 6.25,
            "lastHeard": 1700000000,
            "deviceMetrics": {"batteryLevel": 90}
        }));

        let node = Node::from_raw(&raw);
        assert_eq!(node.id.as_deref(), Some("!0000002a"));
        assert_eq!(node.num, Some(42));
        assert_eq!(node.snr, Some(6.25));
        assert_eq!(node.last_heard, Some(1700000000));
        assert_eq!(node.device_metrics.unwrap()["batteryLevel"], 90);
        assert!(node.position.is_none());
    }

    #[test]
    fn test_node_with_described_user() {
        let raw = RawValue::map([
            ("num", RawValue::Plain(json!(7))),
            (
                "user",
                RawValue::message(FakeUser {
                    id: "!00000007",
                    long_name: "Relay",
                }),
            ),
        ]);

        let node = Node::from_raw(&raw);
        let user = node.user.unwrap();
        assert_eq!(user["longName"], "Relay");
        assert_eq!(user["hwModel"]["name"], "TBEAM");
        assert_eq!(node.id.as_deref(), Some("!00000007"));
    }

    #[test]
    fn test_node_id_derived_from_num() {
        let node = Node::from_raw(&RawValue::Plain(json!({"num": 255})));
        assert_eq!(node.id.as_deref(), Some("!000000ff"));
    }

    #[test]
    fn test_node_matches() {
        let node = Node::from_raw(&RawValue::Plain(json!({"num": 42})));
        assert!(node.matches("!0000002a"));
        assert!(node.matches("42"));
        assert!(!node.matches("43"));
    }

    #[test]
    fn test_node_serializes_camel_case_fields() {
        let node = Node::from_raw(&RawValue::Plain(json!({"num": 1, "lastHeard": 5})));
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["lastHeard"], 5);
        assert!(value.get("deviceMetrics").is_some());
    }

    #[test]
    fn test_channels() {
        let infos = vec![
            ChannelInfo { index: 0, name: None, role: 1 },
            ChannelInfo { index: 1, name: Some("ops".into()), role: 2 },
            ChannelInfo { index: 2, name: None, role: 0 },
            ChannelInfo { index: 3, name: Some(String::new()), role: 9 },
        ];

        let channels = active_channels(&infos);
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].name, "Channel 0");
        assert_eq!(channels[0].role, ChannelRole::Primary);
        assert_eq!(channels[1].name, "ops");
        assert_eq!(channels[2].name, "Channel 3");
        assert_eq!(channels[2].role, ChannelRole::Unknown);
        assert_eq!(serde_json::to_value(ChannelRole::Secondary).unwrap(), "SECONDARY");
    }
}
