//! HTTP ingest API.
//!
//! Plain-text value routes, JSON update routes and a health probe. The
//! security guards from [`super::middleware`] wrap every route.

use super::middleware::{check_trusted_subnet, decompress_gzip, decrypt_body, verify_and_sign, SecurityState};
use crate::core::{MetricDto, MetricKind, TallyError};
use crate::metrics::MetricService;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

/// Shared handler state.
#[derive(Clone)]
pub struct HttpState {
    /// Metric update engine
    pub service: Arc<MetricService>,
}

/// Create the HTTP router with all ingest routes and guards.
pub fn create_http_router(service: Arc<MetricService>, security: Arc<SecurityState>) -> Router {
    let state = HttpState { service };

    Router::new()
        .route("/", get(list_metrics))
        .route("/value", post(get_metric_json))
        .route("/value/:kind/:name", get(get_value))
        .route("/update", post(update_json))
        .route("/update/:kind/:name/:value", post(update_from_path))
        .route("/updates", post(update_batch))
        .route("/ping", get(ping))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(from_fn_with_state(Arc::clone(&security), check_trusted_subnet))
                .layer(from_fn(decompress_gzip))
                .layer(from_fn_with_state(Arc::clone(&security), verify_and_sign))
                .layer(from_fn_with_state(security, decrypt_body)),
        )
        .with_state(state)
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError(TallyError::value_parse(format!("invalid JSON payload: {e}"))))
}

/// `GET /`: every metric as `name:value`, one per line.
async fn list_metrics(State(state): State<HttpState>) -> Result<Response, ApiError> {
    let values = state.service.get_all_values_as_string().await?;
    let mut body = String::new();
    for (name, value) in values {
        body.push_str(&name);
        body.push(':');
        body.push_str(&value);
        body.push('\n');
    }
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// `GET /value/:kind/:name`: formatted value as plain text.
async fn get_value(
    State(state): State<HttpState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let kind: MetricKind = kind.parse()?;
    Ok(state.service.get_value_as_string(kind, &name).await?)
}

/// `POST /value`: DTO lookup by `id` and `type`.
async fn get_metric_json(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<Json<MetricDto>, ApiError> {
    let query: MetricDto = parse_json(&body)?;
    let kind = query.metric_kind()?;
    Ok(Json(state.service.get_metric_as_dto(kind, &query.id).await?))
}

/// `POST /update/:kind/:name/:value`: path-encoded update.
async fn update_from_path(
    State(state): State<HttpState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Result<&'static str, ApiError> {
    state.service.set_metric(&kind, &name, &value).await?;
    Ok("OK")
}

/// `POST /update`: single JSON DTO, echoed with the persisted value.
async fn update_json(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<Json<MetricDto>, ApiError> {
    let dto: MetricDto = parse_json(&body)?;
    Ok(Json(state.service.set_metric_by_dto(dto).await?))
}

/// `POST /updates`: JSON DTO array.
async fn update_batch(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<Json<Vec<MetricDto>>, ApiError> {
    let dtos: Vec<MetricDto> = parse_json(&body)?;
    tracing::debug!(count = dtos.len(), "Received metric batch");
    Ok(Json(state.service.set_metrics_by_dto(dtos).await?))
}

/// `GET /ping`: store health.
async fn ping(State(state): State<HttpState>) -> Result<&'static str, ApiError> {
    state.service.ping().await?;
    Ok("OK")
}

/// Error returned by HTTP handlers and guards.
#[derive(Debug)]
pub struct ApiError(pub TallyError);

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = if status.is_server_error() {
            tracing::error!(category = self.0.category(), "Request failed: {}", self.0);
            "internal server error".to_string()
        } else {
            tracing::debug!(category = self.0.category(), "Request rejected: {}", self.0);
            self.0.to_string()
        };

        let body = Json(serde_json::json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ApiError {}
