//! Metric service semantics against both stores.

mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use tally_lib::core::{Metric, MetricDto, MetricKind, TallyError};
use tally_lib::metrics::MetricService;
use tally_lib::storage::{InMemoryStorage, MetricStore, PoolConfig, SqliteStorage};
use tempfile::TempDir;

async fn sqlite_store(dir: &TempDir) -> Arc<dyn MetricStore> {
    let dsn = dir.path().join("metrics.db");
    let store = SqliteStorage::open(dsn.to_str().unwrap(), &PoolConfig::default())
        .await
        .unwrap();
    Arc::new(store)
}

async fn concurrent_counters(store: Arc<dyn MetricStore>) {
    let service = Arc::new(MetricService::new(store));
    let mut handles = Vec::new();
    for _ in 0..32 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service.set_counter("hits", 2).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(
        service.get_value_as_string(MetricKind::Counter, "hits").await.unwrap(),
        "64"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_counter_updates_in_memory() {
    concurrent_counters(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_counter_updates_sqlite() {
    let dir = TempDir::new().unwrap();
    concurrent_counters(sqlite_store(&dir).await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_counter_updates_sqlite_in_memory() {
    let store = SqliteStorage::open(":memory:", &PoolConfig::default())
        .await
        .unwrap();
    concurrent_counters(Arc::new(store)).await;
}

async fn batch_semantics(store: Arc<dyn MetricStore>) {
    let service = MetricService::new(store);
    service.set_counter("hits", 10).await.unwrap();

    let stored = service
        .set_metrics(vec![
            Metric::counter("hits", 1),
            Metric::gauge("temp", 1.0),
            Metric::counter("hits", 4),
            Metric::gauge("temp", 2.5),
        ])
        .await
        .unwrap();

    assert_eq!(stored.len(), 2);
    assert!(stored.contains(&Metric::counter("hits", 15)));
    assert!(stored.contains(&Metric::gauge("temp", 2.5)));
    assert_eq!(
        service.get_all_values_as_string().await.unwrap(),
        vec![
            ("hits".to_string(), "15".to_string()),
            ("temp".to_string(), "2.5".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_batch_in_memory() {
    batch_semantics(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test]
async fn test_batch_sqlite() {
    let dir = TempDir::new().unwrap();
    batch_semantics(sqlite_store(&dir).await).await;
}

#[tokio::test]
async fn test_invalid_batch_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let service = MetricService::new(sqlite_store(&dir).await);
    service.set_counter("hits", 1).await.unwrap();

    let result = service
        .set_metrics_by_dto(vec![
            MetricDto {
                id: "hits".to_string(),
                kind: "counter".to_string(),
                value: None,
                delta: Some(5),
            },
            MetricDto {
                id: "broken".to_string(),
                kind: "histogram".to_string(),
                value: Some(1.0),
                delta: None,
            },
        ])
        .await;

    assert!(matches!(result, Err(TallyError::UnknownMetricType(_))));
    assert_eq!(
        service.get_value_as_string(MetricKind::Counter, "hits").await.unwrap(),
        "1"
    );
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let service = MetricService::new(sqlite_store(&dir).await);
        service.set_counter("hits", 7).await.unwrap();
        service.set_gauge("temp", 0.25).await.unwrap();
    }

    let service = MetricService::new(sqlite_store(&dir).await);
    service.set_counter("hits", 1).await.unwrap();
    let exported = service.export_metrics().await.unwrap();
    assert_eq!(
        exported,
        vec![Metric::counter("hits", 8).to_dto(), Metric::gauge("temp", 0.25).to_dto()]
    );
    service.ping().await.unwrap();
}

#[tokio::test]
async fn test_same_name_both_kinds() {
    let service = MetricService::new(Arc::new(InMemoryStorage::new()));
    service.set_gauge("x", 1.5).await.unwrap();
    service.set_counter("x", 2).await.unwrap();

    assert_eq!(service.get_value_as_string(MetricKind::Gauge, "x").await.unwrap(), "1.5");
    assert_eq!(service.get_value_as_string(MetricKind::Counter, "x").await.unwrap(), "2");
    assert_eq!(service.get_all_values_as_string().await.unwrap().len(), 2);
}
