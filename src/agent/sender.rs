//! Transports that deliver metrics to the server.
//!
//! Bodies are prepared once per request (encode, encrypt, sign, compress)
//! and the same bytes are replayed on every retry.

use crate::core::{
    retry_with_config, AgentConfig, Metric, MetricDto, Result, RetryConfig, ShutdownSignal,
    TallyError,
};
use crate::receiver::proto::{metrics_client::MetricsClient, MetricProto, UpdateMetricRequest, UpdateMetricsRequest};
use crate::security::{Encryptor, Signer, HASH_HEADER, HASH_METADATA, REAL_IP_HEADER};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use std::io::Write;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers metrics to the server.
#[async_trait::async_trait]
pub trait MetricSender: Send + Sync {
    /// Send the whole batch in one request.
    async fn send_batch(&self, metrics: &[Metric]) -> Result<()>;

    /// Send a single metric.
    async fn send_one(&self, metric: &Metric) -> Result<()>;
}

/// Local address the OS would use to reach `target` (`host:port`).
///
/// Connecting a UDP socket sends nothing; it only resolves the route.
pub fn outbound_ip(target: &str) -> Option<IpAddr> {
    let authority = target
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let remote = authority.to_socket_addrs().ok()?.next()?;
    let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(remote).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2 + 16), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}

/// A request body ready to be sent, possibly several times.
#[derive(Debug, Clone)]
struct PreparedBody {
    body: Bytes,
    signature: Option<String>,
}

/// JSON over HTTP with gzip, HMAC and optional RSA encryption.
pub struct HttpSender {
    client: reqwest::Client,
    base_url: String,
    signer: Signer,
    encryptor: Option<Arc<Encryptor>>,
    real_ip: Option<IpAddr>,
    retry: RetryConfig,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for HttpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSender")
            .field("base_url", &self.base_url)
            .field("signer", &self.signer)
            .field("encrypted", &self.encryptor.is_some())
            .field("real_ip", &self.real_ip)
            .finish_non_exhaustive()
    }
}

impl HttpSender {
    /// Build the sender from the agent configuration.
    ///
    /// `shutdown` cancels pending retries.
    pub fn new(config: &AgentConfig, shutdown: ShutdownSignal) -> Result<Self> {
        let encryptor = match &config.crypto_key {
            Some(path) => Some(Arc::new(Encryptor::from_file(path)?)),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TallyError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            signer: Signer::new(config.key.as_deref()),
            encryptor,
            real_ip: outbound_ip(&config.address),
            retry: RetryConfig {
                max_attempts: config.retry_attempts,
                ..RetryConfig::default()
            },
            shutdown,
        })
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn prepare(&self, json: Vec<u8>) -> Result<PreparedBody> {
        let payload = match &self.encryptor {
            Some(encryptor) => encryptor.encrypt(&json)?,
            None => json,
        };
        let signature = self.signer.sign(&payload);
        Ok(PreparedBody {
            body: Bytes::from(gzip(&payload)?),
            signature,
        })
    }

    async fn post(&self, path: &str, json: Vec<u8>) -> Result<()> {
        let prepared = self.prepare(json)?;
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        let prepared = &prepared;

        retry_with_config(&self.retry, &self.shutdown, |attempt| async move {
            debug!(url, attempt, bytes = prepared.body.len(), "Sending metrics");
            self.post_once(url, prepared).await
        })
        .await
    }

    async fn post_once(&self, url: &str, prepared: &PreparedBody) -> Result<()> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(ACCEPT_ENCODING, "gzip")
            .body(prepared.body.clone());
        if let Some(signature) = &prepared.signature {
            request = request.header(HASH_HEADER, signature.as_str());
        }
        if let Some(ip) = self.real_ip {
            request = request.header(REAL_IP_HEADER, ip.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TallyError::network(format!("request to {url} failed: {e}")))?;
        let status = response.status();
        // Drain the body so the connection can be reused.
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(TallyError::ServerError {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(TallyError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait::async_trait]
impl MetricSender for HttpSender {
    async fn send_batch(&self, metrics: &[Metric]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let dtos: Vec<MetricDto> = metrics.iter().map(MetricDto::from).collect();
        self.post("/updates", serde_json::to_vec(&dtos)?).await
    }

    async fn send_one(&self, metric: &Metric) -> Result<()> {
        self.post("/update", serde_json::to_vec(&metric.to_dto())?).await
    }
}

/// Protobuf over the RPC surface, signed through metadata.
pub struct GrpcSender {
    client: MetricsClient<Channel>,
    signer: Signer,
    retry: RetryConfig,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for GrpcSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcSender")
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl GrpcSender {
    /// Build the sender for `address` (`host:port`).
    ///
    /// The connection is established lazily on the first call.
    pub fn new(config: &AgentConfig, address: &str, shutdown: ShutdownSignal) -> Result<Self> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| TallyError::config(format!("invalid GRPC address {address}: {e}")))?
            .timeout(REQUEST_TIMEOUT)
            .connect_lazy();
        let client = MetricsClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);

        Ok(Self {
            client,
            signer: Signer::new(config.key.as_deref()),
            retry: RetryConfig {
                max_attempts: config.retry_attempts,
                ..RetryConfig::default()
            },
            shutdown,
        })
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn signed<T: Message>(&self, message: T) -> tonic::Request<T> {
        let signature = self.signer.sign(&message.encode_to_vec());
        let mut request = tonic::Request::new(message);
        if let Some(value) = signature.and_then(|s| s.parse::<MetadataValue<Ascii>>().ok()) {
            request.metadata_mut().insert(HASH_METADATA, value);
        }
        request
    }
}

#[async_trait::async_trait]
impl MetricSender for GrpcSender {
    async fn send_batch(&self, metrics: &[Metric]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let message = UpdateMetricsRequest {
            metrics: metrics.iter().map(|m| MetricProto::from(m.to_dto())).collect(),
        };
        let message = &message;
        retry_with_config(&self.retry, &self.shutdown, |attempt| async move {
            debug!(attempt, count = message.metrics.len(), "Sending metrics over GRPC");
            let mut client = self.client.clone();
            client.update_metrics(self.signed(message.clone())).await?;
            Ok(())
        })
        .await
    }

    async fn send_one(&self, metric: &Metric) -> Result<()> {
        let message = UpdateMetricRequest {
            metric: Some(MetricProto::from(metric.to_dto())),
        };
        let message = &message;
        retry_with_config(&self.retry, &self.shutdown, |_attempt| async move {
            let mut client = self.client.clone();
            client.update_metric(self.signed(message.clone())).await?;
            Ok(())
        })
        .await
    }
}
