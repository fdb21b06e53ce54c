//! WebSocket subscription tests over a real listener

use futures::{SinkExt, StreamExt};
use meshgate_core::ConnectionType;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{test_app, TestApp};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(app: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_of_type(ws: &mut Client, event_type: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == event_type {
            return frame;
        }
    }
}

async fn wait_for_subscribers(app: &TestApp, count: usize) -> bool {
    for _ in 0..500 {
        if app.gateway.hub().len().await == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============ Subscription Lifecycle ============

#[tokio::test]
async fn test_first_frame_is_connection_status() {
    let app = test_app();
    let addr = serve(&app).await;
    let mut ws = connect(addr).await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "connection_status");
    assert_eq!(frame["data"]["connected"], false);
}

#[tokio::test]
async fn test_close_unsubscribes() {
    let app = test_app();
    let addr = serve(&app).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await;
    assert!(wait_for_subscribers(&app, 1).await);

    ws.close(None).await.unwrap();
    assert!(wait_for_subscribers(&app, 0).await);
}

// ============ Event Delivery ============

#[tokio::test]
async fn test_device_message_reaches_socket() {
    let app = test_app();
    let addr = serve(&app).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await;

    assert!(app.gateway.connect(ConnectionType::Serial, "/dev/ttyUSB0").await);
    let status = next_of_type(&mut ws, "connection_status").await;
    assert_eq!(status["data"]["connected"], true);

    app.driver.fire_packets_from_thread(vec![json!({
        "id": 77,
        "from": 1,
        "fromId": "!00000001",
        "toId": "^all",
        "channel": 0,
        "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "over the air"}
    })]);

    let message = next_of_type(&mut ws, "message").await;
    assert_eq!(message["data"]["text"], "over the air");
    assert_eq!(message["data"]["sender"], "!00000001");
    assert!(message["data"]["receiver"].is_null());
}

#[tokio::test]
async fn test_every_socket_receives_broadcasts() {
    let app = test_app();
    let addr = serve(&app).await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    next_json(&mut first).await;
    next_json(&mut second).await;
    assert!(wait_for_subscribers(&app, 2).await);

    assert!(app.gateway.connect(ConnectionType::Network, "10.0.0.5").await);

    for ws in [&mut first, &mut second] {
        let status = next_of_type(ws, "connection_status").await;
        assert_eq!(status["data"]["address"], "10.0.0.5:4403");
    }
}

#[tokio::test]
async fn test_client_frames_are_accepted() {
    let app = test_app();
    let addr = serve(&app).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await;

    ws.send(Message::Text("pong".into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.gateway.hub().len().await, 1);
}
