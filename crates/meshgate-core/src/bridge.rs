//! EventBridge - hand-off from driver threads into the async context
//!
//! Driver callbacks run on threads the gateway does not own. They must not
//! block and must not touch async state directly. Instead they submit a
//! unit of work to the bridge, which queues it for a single event-processing
//! task on the runtime.
//!
//! ```text
//!  driver thread ──submit()──► [ FIFO ] ──► context task ──► WorkHandler
//!                   │                              │
//!                   └──── registry (in flight) ◄───┘ removed on completion
//! ```
//!
//! - Work runs in submission order, one unit at a time.
//! - `submit` never blocks. Before the context is started, or while the
//!   registry is full, work is dropped with a warning.
//! - A failing or panicking unit is logged and does not stop the loop.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{GatewayError, Result};

/// Processes units of work inside the async context
#[async_trait]
pub trait WorkHandler<T: Send + 'static>: Send + Sync {
    /// Handle one unit of work
    async fn handle(&self, work: T) -> Result<()>;
}

struct Envelope<T> {
    id: u64,
    work: T,
}

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Units accepted by `submit`
    pub submitted: u64,
    /// Units dropped because the context was not running
    pub dropped_not_running: u64,
    /// Units dropped because the registry was full
    pub dropped_saturated: u64,
    /// Units whose handler returned an error
    pub failed: u64,
    /// Units whose handler panicked
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped_not_running: AtomicU64,
    dropped_saturated: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

struct Inner<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope<T>>>>,
    registry: Mutex<HashMap<u64, Instant>>,
    capacity: usize,
    next_id: AtomicU64,
    counters: Counters,
}

/// Thread-safe entry point into the event-processing context
pub struct EventBridge<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBridge<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> EventBridge<T> {
    /// Create a bridge; nothing runs until [`EventBridge::start`]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(None),
                registry: Mutex::new(HashMap::new()),
                capacity: config.max_in_flight.max(1),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Start the event-processing context on the current runtime
    ///
    /// Must be called from within a tokio runtime. Starting again replaces
    /// the previous context once it has drained.
    pub fn start(&self, handler: Arc<dyn WorkHandler<T>>) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.sender.lock().replace(tx).is_some() {
            warn!("Event bridge restarted, previous context will drain and stop");
        }
        info!(capacity = self.inner.capacity, "Event bridge started");

        let inner = self.inner.clone();
        tokio::spawn(run_context(inner, rx, handler))
    }

    /// Queue a unit of work from any thread
    ///
    /// Never blocks. Work is dropped (and logged) when the context is not
    /// running or the in-flight registry is full.
    pub fn submit(&self, work: T) -> Result<()> {
        let sender = self.inner.sender.lock().clone();
        let Some(sender) = sender else {
            self.inner
                .counters
                .dropped_not_running
                .fetch_add(1, Ordering::Relaxed);
            warn!("Event bridge not running, dropping work");
            return Err(GatewayError::BridgeNotRunning);
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.inner.registry.lock();
            if registry.len() >= self.inner.capacity {
                self.inner
                    .counters
                    .dropped_saturated
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    capacity = self.inner.capacity,
                    "Event bridge registry full, dropping work"
                );
                return Err(GatewayError::BridgeSaturated {
                    capacity: self.inner.capacity,
                });
            }
            registry.insert(id, Instant::now());
        }

        if sender.send(Envelope { id, work }).is_err() {
            self.inner.registry.lock().remove(&id);
            self.inner
                .counters
                .dropped_not_running
                .fetch_add(1, Ordering::Relaxed);
            warn!("Event bridge context gone, dropping work");
            return Err(GatewayError::BridgeNotRunning);
        }

        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(id, "Work submitted");
        Ok(())
    }

    /// Number of units submitted but not yet completed
    pub fn in_flight(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Whether a context is accepting work
    pub fn is_running(&self) -> bool {
        self.inner
            .sender
            .lock()
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Stop accepting work; queued units still run
    pub fn shutdown(&self) {
        if self.inner.sender.lock().take().is_some() {
            info!("Event bridge shutting down");
        }
    }

    /// Get bridge statistics
    pub fn stats(&self) -> BridgeStats {
        let c = &self.inner.counters;
        BridgeStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            dropped_not_running: c.dropped_not_running.load(Ordering::Relaxed),
            dropped_saturated: c.dropped_saturated.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }
}

async fn run_context<T: Send + 'static>(
    inner: Arc<Inner<T>>,
    mut rx: mpsc::UnboundedReceiver<Envelope<T>>,
    handler: Arc<dyn WorkHandler<T>>,
) {
    while let Some(Envelope { id, work }) = rx.recv().await {
        let outcome = AssertUnwindSafe(handler.handle(work)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(id, error = %e, "Bridge work failed");
            }
            Err(_) => {
                inner.counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(id, "Bridge work panicked");
            }
        }

        if let Some(started) = inner.registry.lock().remove(&id) {
            trace!(id, elapsed_us = started.elapsed().as_micros() as u64, "Work done");
        }
    }
    debug!("Event bridge context stopped");
}
