//! Common test utilities and fixtures.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tally_lib::core::{AgentConfig, RetryConfig};
use tally_lib::metrics::MetricService;
use tally_lib::receiver::{create_http_router, SecurityState};
use tally_lib::storage::InMemoryStorage;
use tower::ServiceExt;

/// Metric service over a fresh in-memory store.
pub fn memory_service() -> Arc<MetricService> {
    Arc::new(MetricService::new(Arc::new(InMemoryStorage::new())))
}

/// Router over a fresh in-memory store.
pub fn test_router(security: SecurityState) -> (Router, Arc<MetricService>) {
    let service = memory_service();
    let router = create_http_router(Arc::clone(&service), Arc::new(security));
    (router, service)
}

/// Response parts collected from a oneshot call.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

pub async fn call(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    TestResponse {
        status,
        headers,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

pub fn post_json(uri: &str, json: &str) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

pub fn gzip(body: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).unwrap();
    encoder.finish().unwrap()
}

pub fn gunzip(body: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(body).read_to_end(&mut out).unwrap();
    out
}

/// Agent configuration pointing at `address`.
pub fn agent_config(address: &str) -> AgentConfig {
    AgentConfig {
        address: address.to_string(),
        ..AgentConfig::default()
    }
}

/// Three attempts with millisecond backoff.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default().initial_backoff(Duration::from_millis(10))
}
