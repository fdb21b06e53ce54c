//! Test fakes for the gateway boundaries
//!
//! - [`MockDriver`]: scriptable radio driver. Open failures can be queued,
//!   packets can be delivered synchronously during open, and callbacks can
//!   be fired from any thread.
//! - [`RecordingTransport`]: subscriber transport that records frames.
//! - [`MemoryStore`]: in-memory persistence gateway.
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = Arc::new(MockDriver::new().with_my_node_num(42));
//! let gateway = Gateway::start(GatewayConfig::default(), driver.clone(), None);
//! assert!(gateway.session().connect_serial("/dev/ttyUSB0").await);
//! driver.fire_connection_lost_from_thread();
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{
    ChannelInfo, LinkListener, LinkTarget, OutgoingText, RadioDriver, RadioLink,
    SubscriptionId, TracerouteRequest,
};
use crate::error::{GatewayError, Result};
use crate::event::AckStatus;
use crate::hub::ClientTransport;
use crate::packet::RawValue;
use crate::persistence::{HistoryQuery, MessageRecord, PersistenceGateway};

#[derive(Default)]
struct MockState {
    listeners: HashMap<u64, Arc<dyn LinkListener>>,
    next_id: u64,
    fail_opens: usize,
    fail_close: bool,
    open_attempts: Vec<LinkTarget>,
    queued_on_open: Vec<Value>,
    my_node_num: Option<u32>,
    my_info_on_open: Option<u32>,
    config: Option<Value>,
    ack_on_send: bool,
    fail_sends: bool,
    nodes: Vec<Value>,
    channels: Vec<ChannelInfo>,
    sent_texts: Vec<OutgoingText>,
    traceroutes: Vec<TracerouteRequest>,
    traceroute_delay: Duration,
    closed_links: usize,
}

/// Scriptable in-memory radio driver
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Create a driver whose opens succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Report this own node number on every link
    pub fn with_my_node_num(self, num: u32) -> Self {
        self.state.lock().my_node_num = Some(num);
        self
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().fail_opens = count;
    }

    /// Make link close report an error
    pub fn fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    /// Deliver `packet` to listeners during the next successful open
    pub fn queue_packet_on_open(&self, packet: Value) {
        self.state.lock().queued_on_open.push(packet);
    }

    /// Report `num` through the listeners during open; the link itself
    /// never learns it
    pub fn report_my_info_on_open(&self, num: u32) {
        self.state.lock().my_info_on_open = Some(num);
    }

    /// Set the device configuration
    pub fn set_config(&self, config: Value) {
        self.state.lock().config = Some(config);
    }

    /// Deliver a positive ack from another thread before `send_text` returns
    pub fn ack_on_send(&self, ack: bool) {
        self.state.lock().ack_on_send = ack;
    }

    /// Make `send_text` fail after recording the message
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Set the node database
    pub fn set_nodes(&self, nodes: Vec<Value>) {
        self.state.lock().nodes = nodes;
    }

    /// Set the channel table
    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        self.state.lock().channels = channels;
    }

    /// Make traceroute initiation take this long
    pub fn set_traceroute_delay(&self, delay: Duration) {
        self.state.lock().traceroute_delay = delay;
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Every target passed to open, in order
    pub fn open_attempts(&self) -> Vec<LinkTarget> {
        self.state.lock().open_attempts.clone()
    }

    /// Text messages sent over any link
    pub fn sent_texts(&self) -> Vec<OutgoingText> {
        self.state.lock().sent_texts.clone()
    }

    /// Traceroute requests sent over any link
    pub fn traceroutes(&self) -> Vec<TracerouteRequest> {
        self.state.lock().traceroutes.clone()
    }

    /// Number of links closed
    pub fn closed_links(&self) -> usize {
        self.state.lock().closed_links
    }

    fn listeners(&self) -> Vec<Arc<dyn LinkListener>> {
        self.state.lock().listeners.values().cloned().collect()
    }

    /// Deliver a packet on the calling thread
    pub fn fire_packet(&self, packet: Value) {
        for listener in self.listeners() {
            listener.on_packet(RawValue::Plain(packet.clone()));
        }
    }

    /// Deliver a raw packet on the calling thread
    pub fn fire_raw_packet(&self, packet: RawValue) {
        for listener in self.listeners() {
            listener.on_packet(packet.clone());
        }
    }

    /// Deliver a node update on the calling thread
    pub fn fire_node_updated(&self, node: Value) {
        for listener in self.listeners() {
            listener.on_node_updated(RawValue::Plain(node.clone()));
        }
    }

    /// Report link loss on the calling thread
    pub fn fire_connection_lost(&self) {
        for listener in self.listeners() {
            listener.on_connection_lost();
        }
    }

    /// Report link loss from a separate thread, like a real driver
    pub fn fire_connection_lost_from_thread(&self) {
        let driver = self.clone();
        let _ = std::thread::spawn(move || driver.fire_connection_lost()).join();
    }

    /// Deliver packets from a separate thread, in order
    pub fn fire_packets_from_thread(&self, packets: Vec<Value>) {
        let driver = self.clone();
        let _ = std::thread::spawn(move || {
            for packet in packets {
                driver.fire_packet(packet);
            }
        })
        .join();
    }
}

impl RadioDriver for MockDriver {
    fn subscribe(&self, listener: Arc<dyn LinkListener>) -> SubscriptionId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.listeners.insert(id, listener);
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().listeners.remove(&id.0);
    }

    fn open(&self, target: &LinkTarget) -> Result<Box<dyn RadioLink>> {
        let (queued, my_info) = {
            let mut state = self.state.lock();
            state.open_attempts.push(target.clone());
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(GatewayError::OpenFailed {
                    target: target.to_string(),
                    reason: "device not responding".to_string(),
                });
            }
            (std::mem::take(&mut state.queued_on_open), state.my_info_on_open)
        };

        for packet in queued {
            self.fire_packet(packet);
        }
        if let Some(num) = my_info {
            for listener in self.listeners() {
                listener.on_my_info(num);
            }
        }
        for listener in self.listeners() {
            listener.on_connection_established();
        }

        Ok(Box::new(MockLink {
            state: self.state.clone(),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl RadioLink for MockLink {
    fn my_node_num(&self) -> Option<u32> {
        self.state.lock().my_node_num
    }

    fn nodes(&self) -> Vec<RawValue> {
        self.state
            .lock()
            .nodes
            .iter()
            .cloned()
            .map(RawValue::Plain)
            .collect()
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.state.lock().channels.clone()
    }

    fn config(&self) -> Value {
        self.state
            .lock()
            .config
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    fn send_text(&mut self, message: &OutgoingText) -> Result<()> {
        let (ack_to, fail) = {
            let mut state = self.state.lock();
            state.sent_texts.push(message.clone());
            let ack_to: Vec<_> = if state.ack_on_send {
                state.listeners.values().cloned().collect()
            } else {
                Vec::new()
            };
            (ack_to, state.fail_sends)
        };

        if !ack_to.is_empty() {
            let ack = serde_json::json!({
                "from": 0x20,
                "decoded": {
                    "portnum": "ROUTING_APP",
                    "requestId": message.packet_id,
                    "routing": {"errorReason": "NONE"}
                }
            });
            let _ = std::thread::spawn(move || {
                for listener in ack_to {
                    listener.on_packet(RawValue::Plain(ack.clone()));
                }
            })
            .join();
        }

        if fail {
            return Err(GatewayError::Link("radio busy".to_string()));
        }
        Ok(())
    }

    fn send_traceroute(&mut self, request: &TracerouteRequest) -> Result<()> {
        let delay = self.state.lock().traceroute_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.state.lock().traceroutes.push(request.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed_links += 1;
        if state.fail_close {
            return Err(GatewayError::Link("close failed".to_string()));
        }
        Ok(())
    }
}

/// Subscriber transport that records every frame
#[derive(Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<String>>,
    fail: AtomicBool,
    closed: AtomicBool,
}

impl RecordingTransport {
    /// Create an open transport
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent sends fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Mark the transport closed by the peer
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Raw frames received so far
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Frames parsed as JSON
    pub fn events(&self) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Frames whose `type` is `event_type`
    pub fn events_of(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e["type"] == event_type)
            .collect()
    }

    /// Number of frames whose `type` is `event_type`
    pub fn count_of(&self, event_type: &str) -> usize {
        self.events_of(event_type).len()
    }

    /// Wait until at least `count` frames arrived, up to two seconds
    pub async fn wait_for_frames(&self, count: usize) -> bool {
        for _ in 0..400 {
            if self.frames.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[async_trait]
impl ClientTransport for RecordingTransport {
    async fn send(&self, frame: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("closed".to_string()));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("broken pipe".to_string()));
        }
        self.frames.lock().push(frame.to_string());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-memory persistence gateway
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<MessageRecord>>,
    settings: Mutex<HashMap<String, String>>,
    fail: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every operation fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// All stored messages
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.lock().clone()
    }

    /// Wait until at least `count` messages are stored, up to two seconds
    pub async fn wait_for_messages(&self, count: usize) -> bool {
        for _ in 0..400 {
            if self.messages.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn save_message(&self, record: &MessageRecord) -> Result<i64> {
        self.check()?;
        let mut messages = self.messages.lock();
        let id = messages.len() as i64 + 1;
        let mut record = record.clone();
        record.id = Some(id);
        messages.push(record);
        Ok(id)
    }

    async fn update_ack(&self, packet_id: u32, status: AckStatus) -> Result<bool> {
        self.check()?;
        let mut changed = false;
        for record in self.messages.lock().iter_mut() {
            if record.packet_id == Some(packet_id) && record.ack_status != status {
                record.ack_status = status;
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn get_messages(&self, query: &HistoryQuery) -> Result<Vec<MessageRecord>> {
        self.check()?;
        let matching: Vec<_> = self
            .messages
            .lock()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(query.limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.settings.lock().get(key).cloned())
    }

    async fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.settings
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
