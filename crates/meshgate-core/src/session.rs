//! DeviceSession - ownership and resiliency of the device link
//!
//! The session runs as a single actor task. Connect, disconnect and the
//! reconnect that follows a lost link are commands on its queue, so at most
//! one of those sequences is in flight at any time. Blocking driver calls
//! run on the blocking pool.
//!
//! ```text
//!             connect                   open ok
//! Disconnected ──────► Connecting ─────────────► Connected
//!      ▲                   │ open failed             │ link lost
//!      └───────────────────┘                         ▼
//!      ▲         serial, or reconnect failed    Reconnecting ── reconnect ok ──► Connected
//!      └─────────────────────────────────────────────┘
//! ```
//!
//! Every open registers a fresh [`SessionListener`] tagged with a session
//! epoch. Teardown deactivates the listener before closing the link, and
//! loss notifications carrying an old epoch are ignored. Loss notifications
//! go straight onto the session's command queue, so a saturated event bridge
//! cannot swallow them.
//!
//! Read-only queries and sends borrow the current link through the actor
//! and run beside it; they never block a connect sequence.

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::EventBridge;
use crate::config::{SessionConfig, BROADCAST_ADDR};
use crate::dispatcher::PacketDispatcher;
use crate::driver::{
    LinkListener, LinkTarget, OutgoingText, RadioDriver, RadioLink, SubscriptionId,
    TracerouteRequest,
};
use crate::error::{GatewayError, Result};
use crate::event::{AckStatus, ConnectionStatus, ConnectionType, DomainEvent};
use crate::node::{active_channels, format_node_id, Channel, Node};
use crate::packet::RawValue;
use crate::persistence::{MessageRecord, PersistOp};

/// An open link shared between the actor and in-flight commands
pub type SharedLink = Arc<Mutex<Box<dyn RadioLink>>>;

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link
    #[default]
    Disconnected,
    /// Opening a link on request
    Connecting,
    /// Link open
    Connected,
    /// Link lost, reopening the last network address
    Reconnecting,
}

/// Unit of work crossing from driver threads into the event context
#[derive(Debug)]
pub enum Work {
    /// Publish an event (and persist it when it is a message or ack)
    Event(DomainEvent),
    /// Persistence side effect
    Persist(PersistOp),
    /// The link opened in `epoch` dropped
    ConnectionLost {
        /// Session epoch of the listener that saw the loss
        epoch: u64,
    },
}

/// Outgoing text message request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Message body
    pub text: String,
    /// Destination node id; broadcast when `None`
    pub destination: Option<String>,
    /// Channel index
    pub channel_index: u32,
    /// Packet id this message replies to
    pub reply_id: Option<u32>,
}

/// Driver listener for one session epoch
///
/// Runs on the driver's thread. Everything it produces goes through the
/// bridge; nothing it does may panic out into the driver.
pub struct SessionListener {
    epoch: u64,
    active: AtomicBool,
    bridge: EventBridge<Work>,
    dispatcher: Arc<PacketDispatcher>,
    commands: mpsc::WeakSender<SessionCommand>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionListener {
    fn new(
        epoch: u64,
        bridge: EventBridge<Work>,
        dispatcher: Arc<PacketDispatcher>,
        commands: mpsc::WeakSender<SessionCommand>,
        state: Arc<watch::Sender<SessionState>>,
    ) -> Self {
        Self {
            epoch,
            active: AtomicBool::new(true),
            bridge,
            dispatcher,
            commands,
            state,
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn guarded(&self, what: &str, f: impl FnOnce()) {
        if !self.is_active() {
            return;
        }
        if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(epoch = self.epoch, "Panic while handling {}", what);
        }
    }

    fn submit(&self, work: Work) {
        // Drops are already logged by the bridge
        let _ = self.bridge.submit(work);
    }
}

impl LinkListener for SessionListener {
    fn on_packet(&self, packet: RawValue) {
        self.guarded("packet", || {
            if let Some(event) = self.dispatcher.classify(&packet) {
                self.submit(Work::Event(event));
            }
        });
    }

    fn on_connection_established(&self) {
        self.guarded("connection established", || {
            debug!(epoch = self.epoch, "Driver reports link established");
        });
    }

    fn on_connection_lost(&self) {
        self.guarded("connection lost", || {
            let Some(commands) = self.commands.upgrade() else {
                debug!(epoch = self.epoch, "Session gone, ignoring connection loss");
                return;
            };
            match commands.try_send(SessionCommand::ConnectionLost { epoch: self.epoch }) {
                Ok(()) => {}
                // The context forwards it once the queue has room
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.submit(Work::ConnectionLost { epoch: self.epoch });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(epoch = self.epoch, "Session stopped, ignoring connection loss");
                }
            }
        });
    }

    fn on_node_updated(&self, node: RawValue) {
        self.guarded("node update", || {
            self.submit(Work::Event(DomainEvent::NodeUpdate(Node::from_raw(&node))));
        });
    }

    fn on_my_info(&self, my_node_num: u32) {
        self.guarded("my info", || {
            debug!(epoch = self.epoch, my_node_num, "Own node number reported");
            let mut connected = None;
            self.state.send_if_modified(|s| {
                if s.state == ConnectionState::Disconnected {
                    return false;
                }
                s.status.my_node_num = Some(my_node_num);
                s.status.my_node_id = Some(format_node_id(my_node_num));
                if s.state == ConnectionState::Connected {
                    connected = Some(s.status.clone());
                }
                true
            });
            if let Some(status) = connected {
                self.submit(Work::Event(DomainEvent::ConnectionStatus(status)));
            }
        });
    }
}

/// Snapshot of session state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// State machine position
    pub state: ConnectionState,
    /// Status as reported to callers and subscribers
    pub status: ConnectionStatus,
}

enum SessionCommand {
    Connect {
        target: LinkTarget,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    ConnectionLost {
        epoch: u64,
    },
    Link {
        reply: oneshot::Sender<Option<SharedLink>>,
    },
    Shutdown,
}

/// Handle for controlling the device session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    bridge: EventBridge<Work>,
    config: SessionConfig,
}

impl SessionHandle {
    /// Connect to a serial device
    pub async fn connect_serial(&self, path: &str) -> bool {
        self.connect_target(LinkTarget::Serial {
            path: path.to_string(),
        })
        .await
    }

    /// Connect to a networked device
    pub async fn connect_tcp(&self, host: &str, port: u16) -> bool {
        self.connect_target(LinkTarget::Network {
            host: host.to_string(),
            port,
        })
        .await
    }

    /// Connect by mode and address (`path` or `host[:port]`)
    pub async fn connect(&self, mode: ConnectionType, address: &str) -> bool {
        let target = match mode {
            ConnectionType::Serial => Ok(LinkTarget::Serial {
                path: address.to_string(),
            }),
            ConnectionType::Network => {
                LinkTarget::parse_network(address, self.config.default_tcp_port)
            }
        };
        match target {
            Ok(target) => self.connect_target(target).await,
            Err(e) => {
                error!(%address, error = %e, "Cannot connect");
                false
            }
        }
    }

    /// Connect to a target; failures are logged and reported as `false`
    pub async fn connect_target(&self, target: LinkTarget) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(SessionCommand::Connect { target, reply })
            .await
            .is_err()
        {
            error!("Device session is not running");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close the link and clear session state
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Disconnect { reply })
            .await?;
        rx.await?;
        Ok(())
    }

    /// Report a lost link seen in `epoch`
    ///
    /// Does not wait for the session to handle it.
    pub fn notify_connection_lost(&self, epoch: u64) {
        match self
            .command_tx
            .try_send(SessionCommand::ConnectionLost { epoch })
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                let tx = self.command_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(command).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(epoch, "Session gone, ignoring connection loss");
            }
        }
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.state_rx.borrow().status.clone()
    }

    /// Current state machine position
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().state
    }

    /// Whether a link is open
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch session state changes
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn link(&self) -> Result<SharedLink> {
        let (reply, rx) = oneshot::channel();
        self.command_tx.send(SessionCommand::Link { reply }).await?;
        rx.await?.ok_or(GatewayError::NotConnected)
    }

    async fn with_link<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RadioLink) -> Result<T> + Send + 'static,
    {
        let link = self.link().await?;
        tokio::task::spawn_blocking(move || {
            let mut guard = link.lock();
            f(guard.as_mut())
        })
        .await
        .map_err(|e| GatewayError::Link(e.to_string()))?
    }

    /// All known nodes
    pub async fn nodes(&self) -> Result<Vec<Node>> {
        let raw = self.with_link(|link| Ok(link.nodes())).await?;
        Ok(raw.iter().map(Node::from_raw).collect())
    }

    /// Node by user id, decimal number or `!hex` id
    pub async fn node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.nodes().await?.into_iter().find(|n| n.matches(id)))
    }

    /// Active channels of the local device
    pub async fn channels(&self) -> Result<Vec<Channel>> {
        let infos = self.with_link(|link| Ok(link.channels())).await?;
        Ok(active_channels(&infos))
    }

    /// Device and module configuration
    pub async fn config(&self) -> Result<Value> {
        self.with_link(|link| Ok(link.config())).await
    }

    /// Send a text message, returning its locally generated packet id
    ///
    /// The outgoing record is queued for persistence before the send, so an
    /// ack that beats the send call back still finds it. A failed send
    /// marks the record `nak`.
    pub async fn send_message(&self, request: SendRequest) -> Result<u32> {
        let link = self.link().await?;
        let packet_id = rand::thread_rng().gen_range(1..=u32::MAX);
        let outgoing = OutgoingText {
            packet_id,
            text: request.text.clone(),
            destination: request
                .destination
                .clone()
                .unwrap_or_else(|| BROADCAST_ADDR.to_string()),
            channel_index: request.channel_index,
            want_ack: true,
            reply_id: request.reply_id,
        };

        let sender = self
            .status()
            .my_node_id
            .unwrap_or_else(|| "local".to_string());
        let record = MessageRecord::outgoing(
            packet_id,
            sender,
            request.destination.clone(),
            request.channel_index,
            request.text,
        );
        let _ = self
            .bridge
            .submit(Work::Persist(PersistOp::SaveMessage(record)));

        let sent = tokio::task::spawn_blocking(move || link.lock().send_text(&outgoing))
            .await
            .map_err(|e| GatewayError::Link(e.to_string()))
            .and_then(|result| result);
        if let Err(e) = sent {
            warn!(packet_id, error = %e, "Send failed");
            let _ = self.bridge.submit(Work::Persist(PersistOp::UpdateAck {
                packet_id,
                status: AckStatus::Nak,
            }));
            return Err(e);
        }

        info!(packet_id, destination = ?request.destination, "Message sent");
        Ok(packet_id)
    }

    /// Start a traceroute towards `dest`
    ///
    /// Waits at most `traceroute_timeout` for the device to take the
    /// request. On timeout the request may still go out.
    pub async fn send_traceroute(
        &self,
        dest: &str,
        hop_limit: Option<u8>,
        channel_index: u32,
    ) -> Result<()> {
        let request = TracerouteRequest {
            dest: dest.to_string(),
            hop_limit: hop_limit
                .unwrap_or(self.config.default_hop_limit)
                .min(crate::config::MAX_HOP_LIMIT),
            channel_index,
        };
        let timeout = self.config.traceroute_timeout;

        match tokio::time::timeout(
            timeout,
            self.with_link(move |link| link.send_traceroute(&request)),
        )
        .await
        {
            Ok(result) => {
                if result.is_ok() {
                    info!(%dest, "Traceroute initiated");
                }
                result
            }
            Err(_) => {
                warn!(%dest, "Traceroute initiation timed out");
                Err(GatewayError::TracerouteTimeout {
                    duration_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Stop the session actor, closing any open link
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx.send(SessionCommand::Shutdown).await?;
        Ok(())
    }
}

/// The session actor
pub struct DeviceSession {
    config: SessionConfig,
    driver: Arc<dyn RadioDriver>,
    bridge: EventBridge<Work>,
    dispatcher: Arc<PacketDispatcher>,
    link: Option<SharedLink>,
    target: Option<LinkTarget>,
    subscription: Option<(SubscriptionId, Arc<SessionListener>)>,
    epoch: u64,
    commands: mpsc::WeakSender<SessionCommand>,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl DeviceSession {
    /// Spawn the session actor on the current runtime
    pub fn spawn(
        config: SessionConfig,
        driver: Arc<dyn RadioDriver>,
        bridge: EventBridge<Work>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::default());

        let commands = command_tx.downgrade();
        let handle = SessionHandle {
            command_tx,
            state_rx,
            bridge: bridge.clone(),
            config: config.clone(),
        };

        let session = DeviceSession {
            config,
            driver,
            bridge,
            dispatcher: Arc::new(PacketDispatcher::new()),
            link: None,
            target: None,
            subscription: None,
            epoch: 0,
            commands,
            state_tx: Arc::new(state_tx),
        };
        let task = tokio::spawn(session.run(command_rx));
        (handle, task)
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        info!(driver = self.driver.name(), "Device session started");
        while let Some(command) = command_rx.recv().await {
            match command {
                SessionCommand::Connect { target, reply } => {
                    let connected = self.connect(target).await;
                    let _ = reply.send(connected);
                }
                SessionCommand::Disconnect { reply } => {
                    self.disconnect().await;
                    let _ = reply.send(());
                }
                SessionCommand::ConnectionLost { epoch } => {
                    self.handle_connection_lost(epoch).await;
                }
                SessionCommand::Link { reply } => {
                    let _ = reply.send(self.link.clone());
                }
                SessionCommand::Shutdown => break,
            }
        }
        self.teardown().await;
        info!("Device session stopped");
    }

    async fn connect(&mut self, target: LinkTarget) -> bool {
        self.teardown().await;
        self.set_state(ConnectionState::Connecting, Some(&target));
        info!(link = %target, "Connecting");

        match self.open(&target).await {
            Ok(()) => {
                info!(link = %target, "Connected");
                self.publish_status(None);
                true
            }
            Err(e) => {
                error!(link = %target, error = %e, "Failed to connect");
                self.clear();
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        let was_connected = self.link.is_some();
        self.teardown().await;
        if was_connected {
            info!("Disconnected");
            self.publish_status(None);
        }
    }

    async fn handle_connection_lost(&mut self, epoch: u64) {
        if epoch != self.epoch || self.link.is_none() {
            debug!(epoch, current = self.epoch, "Ignoring stale connection loss");
            return;
        }
        let Some(target) = self.target.clone() else {
            return;
        };
        let reconnect = target.connection_type() == ConnectionType::Network;
        warn!(link = %target, "Connection lost");

        self.set_state(ConnectionState::Reconnecting, Some(&target));
        self.publish_status(Some(reconnect));
        self.release_link().await;

        if !reconnect {
            self.clear();
            return;
        }

        info!(link = %target, "Attempting to reconnect");
        match self.open(&target).await {
            Ok(()) => {
                info!(link = %target, "Reconnection successful");
                self.publish_status(None);
            }
            Err(e) => {
                error!(link = %target, error = %e, "Reconnection failed");
                self.clear();
                self.publish_status(Some(false));
            }
        }
    }

    /// Subscribe, then open. Leaves no subscription behind on failure.
    async fn open(&mut self, target: &LinkTarget) -> Result<()> {
        self.epoch += 1;
        let listener = Arc::new(SessionListener::new(
            self.epoch,
            self.bridge.clone(),
            self.dispatcher.clone(),
            self.commands.clone(),
            self.state_tx.clone(),
        ));
        let id = self.driver.subscribe(listener.clone());
        self.subscription = Some((id, listener));

        let driver = self.driver.clone();
        let open_target = target.clone();
        let opened = tokio::task::spawn_blocking(move || driver.open(&open_target))
            .await
            .map_err(|e| GatewayError::Link(e.to_string()))
            .and_then(|result| result);

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                self.unsubscribe();
                return Err(e);
            }
        };

        // The listener may already have recorded a node number the link
        // has not reported yet
        let reported = link.my_node_num();
        self.link = Some(Arc::new(Mutex::new(link)));
        self.target = Some(target.clone());
        self.state_tx.send_modify(|s| {
            let my_node_num = reported.or(s.status.my_node_num);
            *s = SessionState {
                state: ConnectionState::Connected,
                status: ConnectionStatus {
                    connected: true,
                    connection_type: Some(target.connection_type()),
                    address: Some(target.address()),
                    my_node_id: my_node_num.map(format_node_id),
                    my_node_num,
                    reconnecting: None,
                },
            };
        });
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Some((id, listener)) = self.subscription.take() {
            listener.deactivate();
            self.driver.unsubscribe(id);
        }
    }

    /// Unsubscribe, then close the link ignoring errors
    async fn release_link(&mut self) {
        self.unsubscribe();
        if let Some(link) = self.link.take() {
            let closed = tokio::task::spawn_blocking(move || link.lock().close()).await;
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Ignoring close error"),
                Err(e) => debug!(error = %e, "Ignoring close failure"),
            }
        }
    }

    async fn teardown(&mut self) {
        self.release_link().await;
        self.clear();
    }

    fn clear(&mut self) {
        self.target = None;
        self.state_tx.send_replace(SessionState::default());
    }

    fn set_state(&self, state: ConnectionState, target: Option<&LinkTarget>) {
        self.state_tx.send_modify(|s| {
            s.state = state;
            s.status.connected = state == ConnectionState::Connected;
            if let Some(target) = target {
                s.status.connection_type = Some(target.connection_type());
                s.status.address = Some(target.address());
            }
        });
    }

    fn publish_status(&self, reconnecting: Option<bool>) {
        let mut status = self.state_tx.borrow().status.clone();
        status.reconnecting = reconnecting;
        let _ = self
            .bridge
            .submit(Work::Event(DomainEvent::ConnectionStatus(status)));
    }
}
