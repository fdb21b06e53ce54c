//! WebSocket subscriber transport
//!
//! Each socket becomes one hub subscriber. Outbound frames go through a
//! bounded queue drained by a writer task; a full queue fails the send and
//! the hub drops the subscriber. Any inbound frame counts as activity.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use meshgate_core::{ClientTransport, GatewayError};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::AppState;

/// Frames buffered per socket before it counts as stalled
const OUTBOUND_QUEUE: usize = 256;

struct WsTransport {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send(&self, frame: &str) -> meshgate_core::Result<()> {
        self.tx.try_send(frame.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::Transport("outbound queue full".to_string()),
            TrySendError::Closed(_) => GatewayError::Transport("socket closed".to_string()),
        })
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    // The status snapshot is queued before any broadcast can be
    let id = match state.gateway.subscribe(Arc::new(WsTransport { tx })).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Failed to register WebSocket subscriber");
            return;
        }
    };
    info!(subscriber = id, "WebSocket connection established");

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let hub = state.gateway.hub().clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                other => {
                    if let Message::Text(text) = &other {
                        debug!(subscriber = id, %text, "Client frame");
                    }
                    hub.touch(id).await;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.gateway.hub().unsubscribe(id).await;
    info!(subscriber = id, "WebSocket connection closed");
}
