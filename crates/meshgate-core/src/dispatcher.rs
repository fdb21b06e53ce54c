//! Packet classification
//!
//! Turns a decoded device packet into at most one [`DomainEvent`]. The
//! packet's application port selects a handler from a fixed table; ports
//! without a handler are dropped silently.
//!
//! | Port | Event |
//! |------|-------|
//! | `ROUTING_APP` (5) | [`DomainEvent::Ack`] |
//! | `TRACEROUTE_APP` (70) | [`DomainEvent::Traceroute`] |
//! | `TEXT_MESSAGE_APP` (1) | [`DomainEvent::Message`] |
//! | `POSITION_APP` (3) | [`DomainEvent::Position`] |
//! | `TELEMETRY_APP` (67) | [`DomainEvent::Telemetry`] |

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::config::{BROADCAST_ADDR, BROADCAST_NUM};
use crate::event::{
    AckEvent, AckStatus, DomainEvent, MessageEvent, PositionEvent, TelemetryEvent,
    TracerouteEvent,
};
use crate::node::format_node_id;
use crate::packet::{normalize, RawValue};

/// Routing error reason meaning "no error"
const NO_ERROR: &str = "NONE";

/// Hop value used for unknown or encrypted relays
const UNKNOWN_HOP: u64 = BROADCAST_NUM as u64;

/// Port numbers of the packet classes this gateway handles
/// Based on Meshtastic PortNum enum from portnums.proto
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortNum {
    /// Text message port (UTF-8 encoded strings)
    TextMessage = 1,
    /// Position data
    Position = 3,
    /// Routing protocol messages (acks/naks)
    Routing = 5,
    /// Telemetry data
    Telemetry = 67,
    /// Traceroute responses
    Traceroute = 70,
}

impl PortNum {
    /// Resolve a port tag given either by name or by number
    pub fn from_tag(tag: &Value) -> Option<Self> {
        match tag {
            Value::String(name) => Self::from_name(name),
            Value::Number(n) => n.as_u64().and_then(Self::from_number),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "TEXT_MESSAGE_APP" => Some(Self::TextMessage),
            "POSITION_APP" => Some(Self::Position),
            "ROUTING_APP" => Some(Self::Routing),
            "TELEMETRY_APP" => Some(Self::Telemetry),
            "TRACEROUTE_APP" => Some(Self::Traceroute),
            _ => None,
        }
    }

    fn from_number(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::TextMessage),
            3 => Some(Self::Position),
            5 => Some(Self::Routing),
            67 => Some(Self::Telemetry),
            70 => Some(Self::Traceroute),
            _ => None,
        }
    }
}

type Handler = fn(&Value) -> Option<DomainEvent>;

/// One handler per packet class
const HANDLERS: [(PortNum, Handler); 5] = [
    (PortNum::Routing, handle_routing),
    (PortNum::Traceroute, handle_traceroute),
    (PortNum::TextMessage, handle_text_message),
    (PortNum::Position, handle_position),
    (PortNum::Telemetry, handle_telemetry),
];

fn handler_for(port: PortNum) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, handler)| *handler)
}

/// Dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Packets that produced an event
    pub classified: u64,
    /// Packets whose port has no handler
    pub unhandled: u64,
    /// Packets of a handled class that lacked required fields
    pub skipped: u64,
}

/// Classifies raw packets into domain events
#[derive(Debug, Default)]
pub struct PacketDispatcher {
    classified: AtomicU64,
    unhandled: AtomicU64,
    skipped: AtomicU64,
}

impl PacketDispatcher {
    /// Create a new dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a raw packet
    pub fn classify(&self, raw: &RawValue) -> Option<DomainEvent> {
        self.classify_value(&normalize(raw))
    }

    /// Classify an already plain packet
    pub fn classify_value(&self, packet: &Value) -> Option<DomainEvent> {
        let tag = packet
            .get("decoded")
            .and_then(|d| d.get("portnum"))
            .unwrap_or(&Value::Null);

        let Some(handler) = PortNum::from_tag(tag).and_then(handler_for) else {
            trace!(portnum = %tag, "Ignoring packet without handler");
            self.unhandled.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match handler(packet) {
            Some(event) => {
                debug!(event_type = event.event_type(), "Classified packet");
                self.classified.fetch_add(1, Ordering::Relaxed);
                Some(event)
            }
            None => {
                debug!(portnum = %tag, "Skipping packet missing required fields");
                self.skipped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            classified: self.classified.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

fn decoded(packet: &Value) -> &Value {
    packet.get("decoded").unwrap_or(&Value::Null)
}

fn as_u32(value: Option<&Value>) -> Option<u32> {
    value
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

fn as_string(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// Sender id, falling back to the numeric `from` field
fn sender_id(packet: &Value) -> Option<String> {
    as_string(packet.get("fromId")).or_else(|| as_u32(packet.get("from")).map(format_node_id))
}

fn handle_routing(packet: &Value) -> Option<DomainEvent> {
    let decoded = decoded(packet);
    let packet_id = as_u32(decoded.get("requestId")).filter(|id| *id != 0)?;

    let reason = match decoded.get("routing").and_then(|r| r.get("errorReason")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.as_u64() == Some(0) => NO_ERROR.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => NO_ERROR.to_string(),
    };

    let (status, error) = if reason == NO_ERROR {
        (AckStatus::Ack, None)
    } else {
        (AckStatus::Nak, Some(reason))
    };

    Some(DomainEvent::Ack(AckEvent {
        packet_id,
        status,
        error,
    }))
}

/// Hop list with the unknown-relay and zero sentinels removed
fn hops(value: Option<&Value>) -> Vec<u32> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_u64)
                .filter(|hop| *hop != 0 && *hop != UNKNOWN_HOP)
                .filter_map(|hop| u32::try_from(hop).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn snr_list(value: Option<&Value>) -> Vec<Value> {
    value.and_then(Value::as_array).cloned().unwrap_or_default()
}

fn handle_traceroute(packet: &Value) -> Option<DomainEvent> {
    let decoded = decoded(packet);
    let route = decoded.get("traceroute").unwrap_or(&Value::Null);

    Some(DomainEvent::Traceroute(TracerouteEvent {
        request_id: as_u32(decoded.get("requestId")),
        from: sender_id(packet),
        route: hops(route.get("route")),
        route_back: hops(route.get("routeBack")),
        snr_towards: snr_list(route.get("snrTowards")),
        snr_back: snr_list(route.get("snrBack")),
    }))
}

fn handle_text_message(packet: &Value) -> Option<DomainEvent> {
    let decoded = decoded(packet);

    let receiver = as_string(packet.get("toId"))
        .or_else(|| as_u32(packet.get("to")).map(format_node_id))
        .filter(|to| to != BROADCAST_ADDR && *to != format_node_id(BROADCAST_NUM));

    Some(DomainEvent::Message(MessageEvent {
        packet_id: as_u32(packet.get("id")),
        sender: sender_id(packet).unwrap_or_else(|| "unknown".to_string()),
        receiver,
        channel: as_u32(packet.get("channel")).unwrap_or(0),
        text: as_string(decoded.get("text")).unwrap_or_default(),
        timestamp: packet.get("rxTime").and_then(Value::as_i64),
        snr: packet.get("rxSnr").and_then(Value::as_f64),
        hop_limit: as_u32(packet.get("hopLimit")),
    }))
}

/// Degrees from either the float field or its 1e-7 integer form
fn degrees(position: &Value, field: &str, scaled: &str) -> Option<f64> {
    position
        .get(field)
        .and_then(Value::as_f64)
        .or_else(|| {
            position
                .get(scaled)
                .and_then(Value::as_i64)
                .map(|v| v as f64 * 1e-7)
        })
}

fn handle_position(packet: &Value) -> Option<DomainEvent> {
    let position = decoded(packet).get("position").unwrap_or(&Value::Null);

    Some(DomainEvent::Position(PositionEvent {
        from: sender_id(packet),
        latitude: degrees(position, "latitude", "latitudeI"),
        longitude: degrees(position, "longitude", "longitudeI"),
        altitude: position.get("altitude").and_then(Value::as_f64),
        time: position.get("time").and_then(Value::as_i64),
    }))
}

fn handle_telemetry(packet: &Value) -> Option<DomainEvent> {
    let telemetry = decoded(packet).get("telemetry").unwrap_or(&Value::Null);
    let block = |name: &str| telemetry.get(name).filter(|v| !v.is_null()).cloned();

    Some(DomainEvent::Telemetry(TelemetryEvent {
        from: sender_id(packet),
        device_metrics: block("deviceMetrics"),
        environment_metrics: block("environmentMetrics"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(packet: Value) -> Option<DomainEvent> {
        PacketDispatcher::new().classify(&RawValue::Plain(packet))
    }

    #[test]
    fn test_port_tags() {
        assert_eq!(PortNum::from_tag(&json!("ROUTING_APP")), Some(PortNum::Routing));
        assert_eq!(PortNum::from_tag(&json!(70)), Some(PortNum::Traceroute));
        assert_eq!(PortNum::from_tag(&json!("ADMIN_APP")), None);
        assert_eq!(PortNum::from_tag(&Value::Null), None);
    }

    #[test]
    fn test_routing_ack() {
        let event = classify(json!({
            "decoded": {"portnum": "ROUTING_APP", "requestId": 1234, "routing": {"errorReason": "NONE"}}
        }));

        match event {
            Some(DomainEvent::Ack(ack)) => {
                assert_eq!(ack.packet_id, 1234);
                assert_eq!(ack.status, AckStatus::Ack);
                assert!(ack.error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_routing_nak_carries_reason() {
        let event = classify(json!({
            "decoded": {"portnum": "ROUTING_APP", "requestId": 9, "routing": {"errorReason": "NO_ROUTE"}}
        }));

        match event {
            Some(DomainEvent::Ack(ack)) => {
                assert_eq!(ack.status, AckStatus::Nak);
                assert_eq!(ack.error.as_deref(), Some("NO_ROUTE"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_routing_without_request_id_is_skipped() {
        let dispatcher = PacketDispatcher::new();
        let packet = json!({"decoded": {"portnum": "ROUTING_APP", "routing": {}}});
        assert!(dispatcher.classify_value(&packet).is_none());
        assert_eq!(dispatcher.stats().skipped, 1);
    }

    #[test]
    fn test_routing_missing_reason_is_ack() {
        let event = classify(json!({"decoded": {"portnum": 5, "requestId": 3}}));
        assert!(matches!(event, Some(DomainEvent::Ack(AckEvent { status: AckStatus::Ack, .. }))));
    }

    #[test]
    fn test_traceroute_filters_sentinels_in_order() {
        let event = classify(json!({
            "fromId": "!0000beef",
            "decoded": {
                "portnum": "TRACEROUTE_APP",
                "requestId": 77,
                "traceroute": {
                    "route": [11, 4294967295u64, 0, 22, 33],
                    "routeBack": [0, 44, 4294967295u64],
                    "snrTowards": [12, -4, 8],
                    "snrBack": "garbage"
                }
            }
        }));

        match event {
            Some(DomainEvent::Traceroute(tr)) => {
                assert_eq!(tr.request_id, Some(77));
                assert_eq!(tr.from.as_deref(), Some("!0000beef"));
                assert_eq!(tr.route, vec![11, 22, 33]);
                assert_eq!(tr.route_back, vec![44]);
                assert_eq!(tr.snr_towards, vec![json!(12), json!(-4), json!(8)]);
                assert!(tr.snr_back.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_traceroute_missing_body() {
        let event = classify(json!({"decoded": {"portnum": "TRACEROUTE_APP"}}));
        match event {
            Some(DomainEvent::Traceroute(tr)) => {
                assert!(tr.route.is_empty());
                assert!(tr.route_back.is_empty());
                assert!(tr.snr_towards.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_message_broadcast_receiver_is_absent() {
        let event = classify(json!({
            "id": 555,
            "fromId": "!00000001",
            "toId": "^all",
            "channel": 2,
            "rxTime": 1700000000,
            "rxSnr": 7.5,
            "hopLimit": 3,
            "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "hello mesh"}
        }));

        match event {
            Some(DomainEvent::Message(msg)) => {
                assert_eq!(msg.packet_id, Some(555));
                assert_eq!(msg.sender, "!00000001");
                assert!(msg.receiver.is_none());
                assert_eq!(msg.channel, 2);
                assert_eq!(msg.text, "hello mesh");
                assert_eq!(msg.timestamp, Some(1700000000));
                assert_eq!(msg.snr, Some(7.5));
                assert_eq!(msg.hop_limit, Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_message_direct_receiver_kept() {
        let event = classify(json!({
            "from": 1,
            "toId": "!00000002",
            "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "dm"}
        }));

        match event {
            Some(DomainEvent::Message(msg)) => {
                assert_eq!(msg.sender, "!00000001");
                assert_eq!(msg.receiver.as_deref(), Some("!00000002"));
                assert_eq!(msg.channel, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_message_numeric_broadcast_is_absent() {
        let event = classify(json!({
            "to": 4294967295u64,
            "decoded": {"portnum": 1, "text": "x"}
        }));
        match event {
            Some(DomainEvent::Message(msg)) => {
                assert!(msg.receiver.is_none());
                assert_eq!(msg.sender, "unknown");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_position() {
        let event = classify(json!({
            "fromId": "!00000003",
            "decoded": {
                "portnum": "POSITION_APP",
                "position": {"latitudeI": 520000000, "longitude": 4.5, "altitude": 12, "time": 1700000001}
            }
        }));

        match event {
            Some(DomainEvent::Position(pos)) => {
                assert!((pos.latitude.unwrap() - 52.0).abs() < 1e-9);
                assert_eq!(pos.longitude, Some(4.5));
                assert_eq!(pos.altitude, Some(12.0));
                assert_eq!(pos.time, Some(1700000001));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_telemetry() {
        let event = classify(json!({
            "fromId": "!00000004",
            "decoded": {
                "portnum": "TELEMETRY_APP",
                "telemetry": {"deviceMetrics": {"batteryLevel": 80}}
            }
        }));

        match event {
            Some(DomainEvent::Telemetry(t)) => {
                assert_eq!(t.device_metrics, Some(json!({"batteryLevel": 80})));
                assert!(t.environment_metrics.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_port_dropped_silently() {
        let dispatcher = PacketDispatcher::new();
        assert!(dispatcher
            .classify_value(&json!({"decoded": {"portnum": "NODEINFO_APP"}}))
            .is_none());
        assert!(dispatcher.classify_value(&json!("not a packet")).is_none());
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                classified: 0,
                unhandled: 2,
                skipped: 0
            }
        );
    }
}
