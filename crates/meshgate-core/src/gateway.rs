//! Gateway wiring and the event-processing context
//!
//! [`Gateway::start`] builds the pieces and connects them:
//!
//! ```text
//! RadioDriver ──callbacks──► SessionListener ──submit──► EventBridge
//!                                                          │
//!                                               EventContext (one task)
//!                                      ┌───────────────────┼──────────────────┐
//!                                BroadcastHub      PersistenceGateway     DeviceSession
//!                                 (publish)        (messages, acks)     (loss handling)
//! ```
//!
//! Live delivery comes first; persistence failures are logged and never
//! hold back or undo a broadcast.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{EventBridge, WorkHandler};
use crate::config::GatewayConfig;
use crate::driver::RadioDriver;
use crate::error::{GatewayError, Result};
use crate::event::{ConnectionType, DomainEvent};
use crate::hub::{BroadcastHub, ClientTransport, SubscriberId};
use crate::persistence::{
    HistoryQuery, MessageRecord, PersistOp, PersistenceGateway, SETTING_LAST_ADDRESS,
    SETTING_LAST_CONNECTION_TYPE,
};
use crate::session::{DeviceSession, SessionHandle, Work};

/// Handles bridged work inside the event-processing context
pub struct EventContext {
    hub: BroadcastHub,
    store: Option<Arc<dyn PersistenceGateway>>,
    session: SessionHandle,
}

impl EventContext {
    /// Create a context over the given collaborators
    pub fn new(
        hub: BroadcastHub,
        store: Option<Arc<dyn PersistenceGateway>>,
        session: SessionHandle,
    ) -> Self {
        Self {
            hub,
            store,
            session,
        }
    }

    async fn persist(&self, op: PersistOp) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = op.apply(store.as_ref()).await {
            warn!(error = %e, code = e.error_code(), "Persistence failed");
        }
    }
}

#[async_trait]
impl WorkHandler<Work> for EventContext {
    async fn handle(&self, work: Work) -> Result<()> {
        match work {
            Work::Event(event) => {
                self.hub.publish(&event).await;
                match event {
                    DomainEvent::Message(message) => {
                        self.persist(PersistOp::SaveMessage(MessageRecord::incoming(&message)))
                            .await;
                    }
                    DomainEvent::Ack(ack) => {
                        self.persist(PersistOp::UpdateAck {
                            packet_id: ack.packet_id,
                            status: ack.status,
                        })
                        .await;
                    }
                    _ => {}
                }
            }
            Work::Persist(op) => self.persist(op).await,
            Work::ConnectionLost { epoch } => self.session.notify_connection_lost(epoch),
        }
        Ok(())
    }
}

/// A running gateway: session, bridge, hub and optional store
pub struct Gateway {
    session: SessionHandle,
    hub: BroadcastHub,
    bridge: EventBridge<Work>,
    store: Option<Arc<dyn PersistenceGateway>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Wire everything together and start it on the current runtime
    pub fn start(
        config: GatewayConfig,
        driver: Arc<dyn RadioDriver>,
        store: Option<Arc<dyn PersistenceGateway>>,
    ) -> Self {
        let bridge = EventBridge::new(&config.bridge);
        let hub = BroadcastHub::new(&config.hub);
        let (session, session_task) =
            DeviceSession::spawn(config.session.clone(), driver, bridge.clone());

        let context = Arc::new(EventContext::new(hub.clone(), store.clone(), session.clone()));
        let bridge_task = bridge.start(context);
        let keepalive_task = hub.spawn_keepalive();

        info!("Gateway started");
        Self {
            session,
            hub,
            bridge,
            store,
            tasks: Mutex::new(vec![session_task, bridge_task, keepalive_task]),
        }
    }

    /// Device session handle
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Subscriber hub
    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Event bridge
    pub fn bridge(&self) -> &EventBridge<Work> {
        &self.bridge
    }

    /// Persistence gateway, if configured
    pub fn store(&self) -> Option<&Arc<dyn PersistenceGateway>> {
        self.store.as_ref()
    }

    /// Add a subscriber; it first receives the current connection status
    pub async fn subscribe(&self, transport: Arc<dyn ClientTransport>) -> Result<SubscriberId> {
        let session = self.session.clone();
        self.hub
            .subscribe(transport, move || {
                DomainEvent::ConnectionStatus(session.status())
            })
            .await
    }

    /// User-initiated connect; remembers the target on success
    pub async fn connect(&self, mode: ConnectionType, address: &str) -> bool {
        if !self.session.connect(mode, address).await {
            return false;
        }

        if let Some(store) = &self.store {
            let saved = async {
                store
                    .save_setting(SETTING_LAST_CONNECTION_TYPE, mode.as_str())
                    .await?;
                store.save_setting(SETTING_LAST_ADDRESS, address).await
            }
            .await;
            if let Err(e) = saved {
                warn!(error = %e, "Failed to save connection settings");
            }
        }
        true
    }

    /// Best-effort reconnect to the last saved target
    pub async fn auto_reconnect(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        let saved = async {
            let mode = store.get_setting(SETTING_LAST_CONNECTION_TYPE).await?;
            let address = store.get_setting(SETTING_LAST_ADDRESS).await?;
            Ok::<_, GatewayError>((mode, address))
        }
        .await;

        let (mode, address) = match saved {
            Ok((Some(mode), Some(address))) => (mode, address),
            Ok(_) => {
                debug!("No saved connection");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read connection settings");
                return false;
            }
        };

        let Some(mode) = ConnectionType::parse(&mode) else {
            warn!(%mode, "Unknown saved connection type");
            return false;
        };

        info!(%mode, %address, "Auto-reconnecting");
        let connected = self.session.connect(mode, &address).await;
        if !connected {
            warn!(%address, "Auto-reconnect failed");
        }
        connected
    }

    /// Message history; DMs are resolved against the own node id
    pub async fn get_messages(
        &self,
        channel: Option<u32>,
        dm_partner: Option<String>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| GatewayError::Persistence("no message store".to_string()))?;
        let query = HistoryQuery {
            channel,
            dm_partner,
            my_node_id: self.session.status().my_node_id,
            limit,
        };
        store.get_messages(&query).await
    }

    /// Close the link, stop accepting work and drop subscribers
    pub async fn shutdown(&self) {
        if let Err(e) = self.session.disconnect().await {
            debug!(error = %e, "Session already stopped");
        }
        let _ = self.session.shutdown().await;
        self.bridge.shutdown();
        self.hub.clear().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Gateway stopped");
    }
}
