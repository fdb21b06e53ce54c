//! REST API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meshgate_core::{
    Channel, ConnectionStatus, ConnectionType, GatewayError, MessageRecord, Node, SendRequest,
    DEFAULT_HISTORY_LIMIT,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::AppState;

/// Error body `{"detail": ...}` with an HTTP status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_connected() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Not connected")
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let status = match &e {
            GatewayError::NotConnected
            | GatewayError::InvalidAddress(_)
            | GatewayError::OpenFailed { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn require_connected(state: &AppState) -> Result<(), ApiError> {
    if state.gateway.session().is_connected() {
        Ok(())
    } else {
        Err(ApiError::not_connected())
    }
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Body of `POST /api/connect`
#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    /// `serial`, `network` or `tcp`
    #[serde(rename = "type")]
    pub connection_type: String,
    /// Device path or host[:port]
    pub address: String,
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Value> {
    let mode = ConnectionType::parse(&request.connection_type).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Unknown connection type: {}", request.connection_type),
        )
    })?;

    if !state.gateway.connect(mode, &request.address).await {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Connection failed"));
    }

    Ok(Json(json!({
        "success": true,
        "status": state.gateway.session().status(),
    })))
}

pub async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    state.gateway.session().disconnect().await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<ConnectionStatus> {
    let mut status = state.gateway.session().status();
    status.reconnecting = None;
    Json(status)
}

pub async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Node>> {
    require_connected(&state)?;
    Ok(Json(state.gateway.session().nodes().await?))
}

pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Node> {
    require_connected(&state)?;
    state
        .gateway
        .session()
        .node(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Node not found"))
}

pub async fn list_channels(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Channel>> {
    require_connected(&state)?;
    Ok(Json(state.gateway.session().channels().await?))
}

/// Local device and module configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    require_connected(&state)?;
    Ok(Json(state.gateway.session().config().await?))
}

/// Body of `POST /api/message`
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    /// Message body
    pub text: String,
    /// Destination node id; broadcast when absent
    #[serde(default)]
    pub destination_id: Option<String>,
    /// Channel index
    #[serde(default)]
    pub channel_index: u32,
    /// Packet id being replied to
    #[serde(default)]
    pub reply_id: Option<u32>,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> ApiResult<Value> {
    require_connected(&state)?;

    let packet_id = state
        .gateway
        .session()
        .send_message(SendRequest {
            text: request.text,
            destination: request.destination_id,
            channel_index: request.channel_index,
            reply_id: request.reply_id,
        })
        .await?;

    Ok(Json(json!({ "success": true, "packet_id": packet_id })))
}

/// Optional body of `POST /api/traceroute/:id`
#[derive(Debug, Default, Deserialize)]
pub struct TracerouteBody {
    /// Hop limit; the configured default when absent
    #[serde(default)]
    pub hop_limit: Option<u8>,
    /// Channel index
    #[serde(default)]
    pub channel_index: u32,
}

/// Start a traceroute in the background; the result arrives over `/ws`
pub async fn traceroute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<TracerouteBody>>,
) -> ApiResult<Value> {
    require_connected(&state)?;
    let body = body.map(|Json(body)| body).unwrap_or_default();

    info!(dest = %id, "Traceroute requested");
    let session = state.gateway.session().clone();
    tokio::spawn(async move {
        match session
            .send_traceroute(&id, body.hop_limit, body.channel_index)
            .await
        {
            Ok(()) => {}
            Err(GatewayError::TracerouteTimeout { .. }) => {
                warn!(dest = %id, "Traceroute still pending in background");
            }
            Err(e) => error!(dest = %id, error = %e, "Traceroute failed"),
        }
    });

    Ok(Json(json!({ "success": true, "message": "Traceroute initiated" })))
}

/// Query of `GET /api/messages`
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Channel index
    pub channel: Option<u32>,
    /// DM partner node id
    pub dm_partner: Option<String>,
    /// Maximum number of messages
    pub limit: Option<usize>,
}

pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Vec<MessageRecord>> {
    let messages = state
        .gateway
        .get_messages(
            query.channel,
            query.dm_partner,
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        )
        .await?;
    Ok(Json(messages))
}
