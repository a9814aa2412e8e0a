//! Protobuf messages of the `tally.Metrics` RPC service.
//!
//! The metric message mirrors the JSON DTO field for field.

use crate::core::MetricDto;

/// Metric on the RPC wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricProto {
    /// Metric name
    #[prost(string, tag = "1")]
    pub id: String,
    /// `gauge` or `counter`
    #[prost(string, tag = "2")]
    pub r#type: String,
    /// Gauge payload
    #[prost(double, optional, tag = "3")]
    pub value: Option<f64>,
    /// Counter payload
    #[prost(sint64, optional, tag = "4")]
    pub delta: Option<i64>,
}

impl From<MetricDto> for MetricProto {
    fn from(dto: MetricDto) -> Self {
        Self {
            id: dto.id,
            r#type: dto.kind,
            value: dto.value,
            delta: dto.delta,
        }
    }
}

impl From<MetricProto> for MetricDto {
    fn from(msg: MetricProto) -> Self {
        Self {
            id: msg.id,
            kind: msg.r#type,
            value: msg.value,
            delta: msg.delta,
        }
    }
}

/// Lookup by `id` and `type`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetricRequest {
    /// Metric to look up; payload fields are ignored
    #[prost(message, optional, tag = "1")]
    pub metric: Option<MetricProto>,
}

/// Stored metric.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetricResponse {
    /// Metric with its payload populated
    #[prost(message, optional, tag = "1")]
    pub metric: Option<MetricProto>,
}

/// Single update.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateMetricRequest {
    /// Metric to apply
    #[prost(message, optional, tag = "1")]
    pub metric: Option<MetricProto>,
}

/// Result of a single update.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateMetricResponse {
    /// Metric with the persisted value
    #[prost(message, optional, tag = "1")]
    pub metric: Option<MetricProto>,
}

/// Batched update.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateMetricsRequest {
    /// Metrics to apply
    #[prost(message, repeated, tag = "1")]
    pub metrics: Vec<MetricProto>,
}

/// Result of a batched update.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateMetricsResponse {
    /// Metrics with their persisted values
    #[prost(message, repeated, tag = "1")]
    pub metrics: Vec<MetricProto>,
}

/// Listing request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetAllMetricsRequest {}

/// Every stored metric.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetAllMetricsResponse {
    /// Metrics ordered by name
    #[prost(message, repeated, tag = "1")]
    pub metrics: Vec<MetricProto>,
}

#[allow(missing_docs, clippy::all, clippy::pedantic)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/tally.Metrics.rs"));
}

pub use generated::{metrics_client, metrics_server};
