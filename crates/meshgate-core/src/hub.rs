//! BroadcastHub - fan-out of domain events to live subscribers
//!
//! Each subscriber is a [`ClientTransport`] plus its last inbound activity.
//! Events are serialized once and handed to every subscriber in turn; a
//! failed send only removes that subscriber.
//!
//! New subscribers receive a `connection_status` snapshot before anything
//! else. The snapshot is taken and sent while the registry is write-locked,
//! so no organic event can overtake it.
//!
//! Subscribers with no inbound activity for `idle_timeout` get one `ping`
//! per idle window. Idleness never closes a subscription; only the
//! transport's own close (or a failed send) does.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::HubConfig;
use crate::error::Result;
use crate::event::{DomainEvent, PING_FRAME};

/// Identifies a subscriber within the hub
pub type SubscriberId = u64;

/// Outbound side of a subscriber connection
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Send one serialized frame
    async fn send(&self, frame: &str) -> Result<()>;

    /// Whether the transport has been closed by the peer
    fn is_closed(&self) -> bool;
}

struct Subscription {
    transport: Arc<dyn ClientTransport>,
    last_activity: Instant,
    last_ping: Option<Instant>,
}

impl Subscription {
    /// Start of the current idle window
    fn idle_since(&self) -> Instant {
        match self.last_ping {
            Some(ping) if ping > self.last_activity => ping,
            _ => self.last_activity,
        }
    }
}

/// Registry of live subscribers
#[derive(Clone)]
pub struct BroadcastHub {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Subscription>>>,
    next_id: Arc<AtomicU64>,
    idle_timeout: Duration,
    keepalive_tick: Duration,
}

impl BroadcastHub {
    /// Create an empty hub
    pub fn new(config: &HubConfig) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            idle_timeout: config.idle_timeout,
            keepalive_tick: config.keepalive_tick,
        }
    }

    /// Register a subscriber and send it the current status snapshot
    ///
    /// `snapshot` is evaluated under the registry lock. If the snapshot
    /// cannot be delivered the subscriber is not registered.
    pub async fn subscribe<F>(
        &self,
        transport: Arc<dyn ClientTransport>,
        snapshot: F,
    ) -> Result<SubscriberId>
    where
        F: FnOnce() -> DomainEvent,
    {
        let mut subscribers = self.subscribers.write().await;

        let frame = snapshot().to_frame()?;
        transport.send(&frame).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(
            id,
            Subscription {
                transport,
                last_activity: Instant::now(),
                last_ping: None,
            },
        );
        info!(subscriber = id, total = subscribers.len(), "Subscriber added");
        Ok(id)
    }

    /// Remove a subscriber; unknown ids are ignored
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().await.remove(&id).is_some();
        if removed {
            info!(subscriber = id, "Subscriber removed");
        }
        removed
    }

    /// Record inbound activity from a subscriber
    pub async fn touch(&self, id: SubscriberId) {
        if let Some(sub) = self.subscribers.write().await.get_mut(&id) {
            sub.last_activity = Instant::now();
        }
    }

    /// Deliver an event to every subscriber, returning how many received it
    pub async fn publish(&self, event: &DomainEvent) -> usize {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = event.event_type(), error = %e, "Failed to serialize event");
                return 0;
            }
        };
        trace!(event = event.event_type(), "Publishing");
        self.publish_frame(&frame).await
    }

    async fn publish_frame(&self, frame: &str) -> usize {
        let mut failed = Vec::new();
        let mut delivered = 0;
        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                if sub.transport.is_closed() {
                    failed.push(*id);
                    continue;
                }
                match sub.transport.send(frame).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(subscriber = id, error = %e, "Send failed, dropping subscriber");
                        failed.push(*id);
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in failed {
                subscribers.remove(&id);
            }
        }
        delivered
    }

    /// Ping subscribers idle for a full window, returning how many were pinged
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let mut pinged = 0;
        let mut failed = Vec::new();

        for (id, sub) in subscribers.iter_mut() {
            if sub.transport.is_closed() {
                debug!(subscriber = id, "Transport closed");
                failed.push(*id);
                continue;
            }
            if now.saturating_duration_since(sub.idle_since()) < self.idle_timeout {
                continue;
            }
            match sub.transport.send(PING_FRAME).await {
                Ok(()) => {
                    sub.last_ping = Some(now);
                    pinged += 1;
                }
                Err(e) => {
                    warn!(subscriber = id, error = %e, "Ping failed, dropping subscriber");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            subscribers.remove(&id);
        }
        pinged
    }

    /// Periodically ping idle subscribers until the task is aborted
    pub fn spawn_keepalive(&self) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.keepalive_tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                hub.sweep_idle(Instant::now()).await;
            }
        })
    }

    /// Number of live subscribers
    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Whether no subscriber is registered
    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Close out every subscription
    pub async fn clear(&self) {
        let mut subscribers = self.subscribers.write().await;
        if !subscribers.is_empty() {
            info!(count = subscribers.len(), "Dropping all subscribers");
        }
        subscribers.clear();
    }
}
