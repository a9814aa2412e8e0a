//! Snapshot restore and export through the server.

mod common;

use axum::http::StatusCode;
use common::{call, get, post_json};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tally_lib::core::{MetricDto, ServerConfig, ShutdownSignal};
use tally_lib::receiver::IngestServer;
use tempfile::TempDir;
use tokio::net::TcpListener;

fn config(dir: &TempDir, interval: Duration) -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".to_string(),
        file_storage_path: dir.path().join("metrics-db.json"),
        store_interval: interval,
        restore: true,
        ..ServerConfig::default()
    }
}

fn read_snapshot(dir: &TempDir) -> Vec<MetricDto> {
    let raw = std::fs::read_to_string(dir.path().join("metrics-db.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn test_restore_then_export() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("metrics-db.json"),
        r#"[{"id":"x","type":"counter","delta":7}]"#,
    )
    .unwrap();

    let server = IngestServer::new(config(&dir, Duration::from_secs(300))).await.unwrap();
    let router = server.router();

    let resp = call(&router, get("/value/counter/x")).await;
    assert_eq!(resp.body, "7");

    let resp = call(&router, post_json("/update", r#"{"id":"x","type":"counter","delta":5}"#)).await;
    assert_eq!(resp.status, StatusCode::OK);

    server.snapshot().unwrap().export().await.unwrap();
    assert_eq!(
        read_snapshot(&dir),
        vec![MetricDto {
            id: "x".to_string(),
            kind: "counter".to_string(),
            value: None,
            delta: Some(12),
        }]
    );
}

#[tokio::test]
async fn test_restore_disabled_ignores_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("metrics-db.json"),
        r#"[{"id":"x","type":"counter","delta":7}]"#,
    )
    .unwrap();

    let mut cfg = config(&dir, Duration::from_secs(300));
    cfg.restore = false;
    let server = IngestServer::new(cfg).await.unwrap();

    let resp = call(&server.router(), get("/value/counter/x")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_corrupt_snapshot_is_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("metrics-db.json"), "[{oops").unwrap();
    assert!(IngestServer::new(config(&dir, Duration::from_secs(300))).await.is_err());
}

#[tokio::test]
async fn test_zero_interval_writes_through() {
    let dir = TempDir::new().unwrap();
    let server = IngestServer::new(config(&dir, Duration::ZERO)).await.unwrap();
    let router = server.router();

    call(&router, post_json("/update", r#"{"id":"temp","type":"gauge","value":4.5}"#)).await;

    assert_eq!(
        read_snapshot(&dir),
        vec![MetricDto {
            id: "temp".to_string(),
            kind: "gauge".to_string(),
            value: Some(4.5),
            delta: None,
        }]
    );
}

#[tokio::test]
async fn test_shutdown_writes_final_snapshot() {
    let dir = TempDir::new().unwrap();
    let server = IngestServer::new(config(&dir, Duration::from_secs(300))).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (trigger, shutdown) = ShutdownSignal::new();
    let handle = tokio::spawn(server.serve(listener, None, shutdown));

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/update/counter/hits/3"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "OK");

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let snapshot = read_snapshot(&dir);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "hits");
    assert_eq!(snapshot[0].delta, Some(3));
}
