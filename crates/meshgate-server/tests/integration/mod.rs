//! HTTP and WebSocket tests against a gateway backed by the mock driver

mod rest_handlers;
mod websocket_handlers;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use meshgate_core::test_utils::{MemoryStore, MockDriver};
use meshgate_core::{Gateway, GatewayConfig, PersistenceGateway, RadioDriver};
use meshgate_server::{create_router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

pub const MY_NODE_NUM: u32 = 0x0a0b_0c0d;

pub struct TestApp {
    pub router: Router,
    pub gateway: Arc<Gateway>,
    pub driver: MockDriver,
    pub store: Arc<MemoryStore>,
}

pub fn test_app() -> TestApp {
    let driver = MockDriver::new().with_my_node_num(MY_NODE_NUM);
    let store = MemoryStore::new();
    let radio: Arc<dyn RadioDriver> = Arc::new(driver.clone());
    let persistence: Arc<dyn PersistenceGateway> = store.clone();
    let gateway = Arc::new(Gateway::start(
        GatewayConfig::default(),
        radio,
        Some(persistence),
    ));
    let router = create_router(Arc::new(AppState::new(gateway.clone())));

    TestApp {
        router,
        gateway,
        driver,
        store,
    }
}

/// Send one request; non-JSON bodies come back as a JSON string
pub async fn request(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

pub async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    request(router, Method::GET, uri, None).await
}

pub async fn post(router: &Router, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    request(router, Method::POST, uri, body).await
}
