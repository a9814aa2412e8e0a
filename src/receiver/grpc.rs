//! RPC ingest surface.
//!
//! Mirrors the HTTP routes over `tally.Metrics`. The peer address of the
//! connection feeds the subnet filter, and the `hashsha256` metadata
//! carries the HMAC of the protobuf-encoded message in both directions.

use super::middleware::SecurityState;
use super::proto::{
    metrics_server::{Metrics, MetricsServer},
    GetAllMetricsRequest, GetAllMetricsResponse, GetMetricRequest, GetMetricResponse, MetricProto,
    UpdateMetricRequest, UpdateMetricResponse, UpdateMetricsRequest, UpdateMetricsResponse,
};
use crate::core::MetricDto;
use crate::metrics::MetricService;
use crate::security::HASH_METADATA;
use prost::Message;
use std::sync::Arc;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Response, Status};

/// RPC service implementation.
pub struct GrpcMetricsService {
    service: Arc<MetricService>,
    security: Arc<SecurityState>,
}

/// Wrap the service for `tonic::transport::Server`.
pub fn create_grpc_service(
    service: Arc<MetricService>,
    security: Arc<SecurityState>,
) -> MetricsServer<GrpcMetricsService> {
    MetricsServer::new(GrpcMetricsService { service, security })
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip)
}

impl GrpcMetricsService {
    /// Subnet filter and HMAC verification.
    fn admit<T: Message>(&self, request: &Request<T>) -> Result<(), Status> {
        let peer = request.remote_addr().map(|addr| addr.ip());
        if let Err(e) = self.security.acl.check(peer) {
            tracing::warn!(?peer, "RPC rejected by subnet filter: {}", e);
            return Err(e.into());
        }

        if self.security.signer.is_enabled() {
            let body = request.get_ref().encode_to_vec();
            let signature = request
                .metadata()
                .get(HASH_METADATA)
                .and_then(|v| v.to_str().ok());
            if let Err(e) = self.security.signer.verify(&body, signature) {
                tracing::warn!(?peer, "RPC rejected with bad signature");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Build a response signed over its encoded message.
    fn respond<T: Message>(&self, message: T) -> Response<T> {
        let signature = self.security.signer.sign(&message.encode_to_vec());
        let mut response = Response::new(message);
        if let Some(value) = signature.and_then(|s| s.parse::<MetadataValue<Ascii>>().ok()) {
            response.metadata_mut().insert(HASH_METADATA, value);
        }
        response
    }
}

fn required(metric: Option<MetricProto>) -> Result<MetricDto, Status> {
    metric
        .map(MetricDto::from)
        .ok_or_else(|| Status::invalid_argument("metric is required"))
}

#[tonic::async_trait]
impl Metrics for GrpcMetricsService {
    async fn get_metric(
        &self,
        request: Request<GetMetricRequest>,
    ) -> Result<Response<GetMetricResponse>, Status> {
        self.admit(&request)?;
        let query = required(request.into_inner().metric)?;
        let kind = query.metric_kind()?;
        let found = self.service.get_metric_as_dto(kind, &query.id).await?;
        Ok(self.respond(GetMetricResponse {
            metric: Some(found.into()),
        }))
    }

    async fn update_metric(
        &self,
        request: Request<UpdateMetricRequest>,
    ) -> Result<Response<UpdateMetricResponse>, Status> {
        self.admit(&request)?;
        let dto = required(request.into_inner().metric)?;
        let stored = self.service.set_metric_by_dto(dto).await?;
        Ok(self.respond(UpdateMetricResponse {
            metric: Some(stored.into()),
        }))
    }

    async fn update_metrics(
        &self,
        request: Request<UpdateMetricsRequest>,
    ) -> Result<Response<UpdateMetricsResponse>, Status> {
        self.admit(&request)?;
        let dtos: Vec<MetricDto> = request
            .into_inner()
            .metrics
            .into_iter()
            .map(MetricDto::from)
            .collect();
        tracing::debug!(count = dtos.len(), "Received RPC metric batch");
        let stored = self.service.set_metrics_by_dto(dtos).await?;
        Ok(self.respond(UpdateMetricsResponse {
            metrics: stored.into_iter().map(MetricProto::from).collect(),
        }))
    }

    async fn get_all_metrics(
        &self,
        request: Request<GetAllMetricsRequest>,
    ) -> Result<Response<GetAllMetricsResponse>, Status> {
        self.admit(&request)?;
        let all = self.service.export_metrics().await?;
        Ok(self.respond(GetAllMetricsResponse {
            metrics: all.into_iter().map(MetricProto::from).collect(),
        }))
    }
}
