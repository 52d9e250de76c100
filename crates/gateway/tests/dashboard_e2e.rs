//! End-to-end: a real client against a real gateway over a local socket.

#![allow(clippy::unwrap_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    llamadash_client::DashboardClient,
    llamadash_config::{ClientConfig, DashboardConfig},
    llamadash_gateway::{MethodRegistry, build_gateway, serve_gateway},
    llamadash_protocol::{ModelStatus, methods::NewModel},
    serde_json::json,
    tokio::net::TcpListener,
};

/// Start a gateway on an ephemeral port.
async fn start_server() -> SocketAddr {
    start_server_with(DashboardConfig::default()).await
}

async fn start_server_with(config: DashboardConfig) -> SocketAddr {
    let state = build_gateway(&config);
    let methods = Arc::new(MethodRegistry::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve_gateway(listener, state, methods).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> DashboardClient {
    let config = ClientConfig {
        url: format!("ws://{addr}{}", llamadash_protocol::DEFAULT_WS_PATH),
        ..ClientConfig::default()
    };
    let client = DashboardClient::new(&config, 50);
    client.connect();
    assert!(client.wait_connected(Duration::from_secs(5)).await);
    client
}

async fn until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn caches_follow_the_gateway() {
    let addr = start_server().await;
    let client = connect(addr).await;

    until(|| {
        client.models().is_loaded()
            && client.logs().is_loaded()
            && client.presets().is_loaded()
            && client.router().get().is_some()
    })
    .await;
    assert!(client.models().is_empty());
    assert!(!client.router().is_running());

    let model = client
        .models()
        .create(NewModel {
            name: "llama-3".into(),
            path: Some("/models/llama-3.gguf".into()),
            ..NewModel::default()
        })
        .await
        .unwrap();
    assert!(client.models().contains(&model.id));

    let status = client.router().start().await.unwrap();
    assert!(status.is_running());
    until(|| client.router().is_running()).await;
    until(|| !client.logs().is_empty()).await;

    client.models().start(&model.id).await.unwrap();
    until(|| {
        client
            .models()
            .get(&model.id)
            .is_some_and(|m| m.status == ModelStatus::Loaded)
    })
    .await;

    client.router().stop().await.unwrap();
    until(|| {
        client
            .models()
            .get(&model.id)
            .is_some_and(|m| m.status == ModelStatus::Unloaded)
    })
    .await;

    client.models().delete(&model.id).await.unwrap();
    assert!(!client.models().contains(&model.id));
}

#[tokio::test]
async fn single_slot_queue_still_answers_requests() {
    let mut config = DashboardConfig::default();
    config.server.outbound_buffer = 0;
    let addr = start_server_with(config).await;
    let client = connect(addr).await;

    until(|| client.models().is_loaded() && client.presets().is_loaded()).await;
    for name in ["a", "b", "c"] {
        let model = client
            .models()
            .create(NewModel {
                name: name.into(),
                ..NewModel::default()
            })
            .await
            .unwrap();
        assert_eq!(model.name, name);
    }
}

#[tokio::test]
async fn broadcasts_reach_other_clients() {
    let addr = start_server().await;
    let writer = connect(addr).await;
    let watcher = connect(addr).await;
    until(|| watcher.models().is_loaded()).await;

    let model = writer
        .models()
        .create(NewModel {
            name: "qwen".into(),
            ..NewModel::default()
        })
        .await
        .unwrap();
    until(|| watcher.models().contains(&model.id)).await;
}

#[tokio::test]
async fn unknown_events_and_bad_ids_fail_with_server_message() {
    let addr = start_server().await;
    let client = connect(addr).await;

    let err = client
        .request("models:explode", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Unknown event: models:explode");

    let err = client
        .request("presets:read", json!({ "filename": "missing" }))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Preset not found: missing");
}

#[tokio::test]
async fn health_reports_connections() {
    let addr = start_server().await;
    let client = connect(addr).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    client.disconnect();
}
