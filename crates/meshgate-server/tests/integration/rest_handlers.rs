//! REST API handler behavior tests

use axum::http::StatusCode;
use meshgate_core::{
    ChannelInfo, ConnectionType, MessageRecord, PersistenceGateway, SETTING_LAST_ADDRESS,
    SETTING_LAST_CONNECTION_TYPE,
};
use serde_json::json;
use std::time::Duration;

use super::{get, post, test_app, MY_NODE_NUM};

async fn connected_app() -> super::TestApp {
    let app = test_app();
    assert!(
        app.gateway
            .connect(ConnectionType::Serial, "/dev/ttyUSB0")
            .await
    );
    app
}

// ============ Health & Status ============

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    let app = test_app();
    let (status, body) = get(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!("OK"));
}

#[tokio::test]
async fn test_status_when_disconnected() {
    let app = test_app();
    let (status, body) = get(&app.router, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], false);
    assert!(body.get("reconnecting").is_none());
}

#[tokio::test]
async fn test_device_routes_require_connection() {
    let app = test_app();

    for uri in [
        "/api/nodes",
        "/api/channels",
        "/api/config",
        "/api/node/!00000001",
    ] {
        let (status, body) = get(&app.router, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["detail"], "Not connected");
    }

    let (status, _) = post(&app.router, "/api/message", Some(json!({"text": "hi"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&app.router, "/api/traceroute/!00000001", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.driver.traceroutes().is_empty());
}

// ============ Connection ============

#[tokio::test]
async fn test_connect_tcp_saves_settings() {
    let app = test_app();
    let (status, body) = post(
        &app.router,
        "/api/connect",
        Some(json!({"type": "tcp", "address": "10.0.0.5"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"]["connected"], true);
    assert_eq!(body["status"]["address"], "10.0.0.5:4403");
    assert_eq!(body["status"]["my_node_id"], "!0a0b0c0d");

    assert_eq!(
        app.store
            .get_setting(SETTING_LAST_CONNECTION_TYPE)
            .await
            .unwrap()
            .as_deref(),
        Some("network")
    );
    assert_eq!(
        app.store.get_setting(SETTING_LAST_ADDRESS).await.unwrap().as_deref(),
        Some("10.0.0.5")
    );
}

#[tokio::test]
async fn test_connect_rejects_unknown_type() {
    let app = test_app();
    let (status, body) = post(
        &app.router,
        "/api/connect",
        Some(json!({"type": "bluetooth", "address": "AA:BB"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("bluetooth"));
    assert!(app.driver.open_attempts().is_empty());
}

#[tokio::test]
async fn test_connect_failure_is_bad_request() {
    let app = test_app();
    app.driver.fail_next_opens(1);
    let (status, body) = post(
        &app.router,
        "/api/connect",
        Some(json!({"type": "serial", "address": "/dev/ttyUSB0"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Connection failed");
    assert!(app.store.get_setting(SETTING_LAST_ADDRESS).await.unwrap().is_none());
}

#[tokio::test]
async fn test_disconnect() {
    let app = connected_app().await;
    let (status, body) = post(&app.router, "/api/disconnect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = get(&app.router, "/api/status").await;
    assert_eq!(body["connected"], false);
    assert_eq!(app.driver.closed_links(), 1);
}

// ============ Device Queries ============

#[tokio::test]
async fn test_node_lookup() {
    let app = test_app();
    app.driver.set_nodes(vec![
        json!({"num": 1, "user": {"id": "!00000001", "longName": "Alpha"}, "snr": 6.5}),
        json!({"num": 2, "user": {"id": "!00000002", "longName": "Bravo"}}),
    ]);
    assert!(app.gateway.connect(ConnectionType::Serial, "/dev/ttyUSB0").await);

    let (status, body) = get(&app.router, "/api/nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, body) = get(&app.router, "/api/node/!00000001").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["longName"], "Alpha");

    let (status, body) = get(&app.router, "/api/node/2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "!00000002");

    let (status, body) = get(&app.router, "/api/node/!00000099").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "Node not found");
}

#[tokio::test]
async fn test_config_dump() {
    let app = test_app();
    app.driver.set_config(json!({
        "localConfig": {"lora": {"region": "EU_868", "hopLimit": 3}},
        "moduleConfig": {"mqtt": {"enabled": false}}
    }));
    assert!(app.gateway.connect(ConnectionType::Serial, "/dev/ttyUSB0").await);

    let (status, body) = get(&app.router, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["localConfig"]["lora"]["region"], "EU_868");
    assert_eq!(body["moduleConfig"]["mqtt"]["enabled"], false);
}

#[tokio::test]
async fn test_config_empty_until_reported() {
    let app = connected_app().await;
    let (status, body) = get(&app.router, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn test_channels_omit_disabled() {
    let app = test_app();
    app.driver.set_channels(vec![
        ChannelInfo {
            index: 0,
            name: None,
            role: 1,
        },
        ChannelInfo {
            index: 1,
            name: Some("ops".into()),
            role: 2,
        },
        ChannelInfo {
            index: 2,
            name: None,
            role: 0,
        },
    ]);
    assert!(app.gateway.connect(ConnectionType::Serial, "/dev/ttyUSB0").await);

    let (status, body) = get(&app.router, "/api/channels").await;
    assert_eq!(status, StatusCode::OK);
    let channels = body.as_array().unwrap();
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0]["name"], "Channel 0");
    assert_eq!(channels[1]["name"], "ops");
}

// ============ Commands ============

#[tokio::test]
async fn test_send_message() {
    let app = connected_app().await;
    let (status, body) = post(
        &app.router,
        "/api/message",
        Some(json!({"text": "hello mesh", "destination_id": "!00000002", "channel_index": 1})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let packet_id = body["packet_id"].as_u64().unwrap() as u32;

    let sent = app.driver.sent_texts();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_id, packet_id);
    assert_eq!(sent[0].destination, "!00000002");
    assert_eq!(sent[0].channel_index, 1);
    assert!(sent[0].want_ack);

    assert!(app.store.wait_for_messages(1).await);
    let stored = &app.store.messages()[0];
    assert_eq!(stored.packet_id, Some(packet_id));
    assert_eq!(stored.sender, format!("!{:08x}", MY_NODE_NUM));
}

#[tokio::test]
async fn test_broadcast_message_defaults() {
    let app = connected_app().await;
    let (status, _) = post(&app.router, "/api/message", Some(json!({"text": "cq"}))).await;
    assert_eq!(status, StatusCode::OK);

    let sent = app.driver.sent_texts();
    assert_eq!(sent[0].destination, "^all");
    assert_eq!(sent[0].channel_index, 0);
}

#[tokio::test]
async fn test_traceroute_runs_in_background() {
    let app = connected_app().await;
    app.driver.set_traceroute_delay(Duration::from_millis(100));

    let (status, body) = post(&app.router, "/api/traceroute/!00000002", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Traceroute initiated");

    for _ in 0..200 {
        if !app.driver.traceroutes().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let requests = app.driver.traceroutes();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].dest, "!00000002");
    assert_eq!(requests[0].hop_limit, 7);
}

#[tokio::test]
async fn test_traceroute_body_is_used() {
    let app = connected_app().await;
    let (status, _) = post(
        &app.router,
        "/api/traceroute/!00000003",
        Some(json!({"hop_limit": 3, "channel_index": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..200 {
        if !app.driver.traceroutes().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let requests = app.driver.traceroutes();
    assert_eq!(requests[0].hop_limit, 3);
    assert_eq!(requests[0].channel_index, 2);
}

// ============ History ============

#[tokio::test]
async fn test_message_history_queries() {
    let app = connected_app().await;
    let me = format!("!{:08x}", MY_NODE_NUM);

    let mut public = MessageRecord::outgoing(1, &me, None, 0, "public");
    public.timestamp = 100;
    app.store.save_message(&public).await.unwrap();
    app.store
        .save_message(&MessageRecord::outgoing(2, &me, None, 1, "other channel"))
        .await
        .unwrap();
    app.store
        .save_message(&MessageRecord::outgoing(3, &me, Some("!00000002".to_string()), 0, "dm"))
        .await
        .unwrap();

    let (status, body) = get(&app.router, "/api/messages?channel=0").await;
    assert_eq!(status, StatusCode::OK);
    let texts: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["public"]);

    let (_, body) = get(&app.router, "/api/messages?dm_partner=!00000002").await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["text"], "dm");
    assert_eq!(body[0]["direction"], "outgoing");

    let (_, body) = get(&app.router, "/api/messages?limit=2").await;
    let texts: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["other channel", "dm"]);
}
