//! Server runtime: HTTP and RPC ingest over a shared metric service.

pub mod grpc;
pub mod http;
pub mod middleware;
pub mod proto;

pub use grpc::{create_grpc_service, GrpcMetricsService};
pub use http::{create_http_router, ApiError};
pub use middleware::SecurityState;

use crate::core::{Result, ServerConfig, ShutdownSignal, TallyError};
use crate::metrics::MetricService;
use crate::storage::{open_store, SnapshotConfig, SnapshotService};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;

/// Time allowed for servers to finish in-flight requests after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The metric ingest server.
pub struct IngestServer {
    config: ServerConfig,
    service: Arc<MetricService>,
    security: Arc<SecurityState>,
    snapshot: Option<Arc<SnapshotService>>,
}

impl std::fmt::Debug for IngestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestServer")
            .field("address", &self.config.address)
            .field("grpc_address", &self.config.grpc_address)
            .field("store", &self.service.store().name())
            .finish_non_exhaustive()
    }
}

impl IngestServer {
    /// Open the store, load keys and restore the snapshot.
    ///
    /// Every failure here is fatal: bad configuration, unreadable keys, an
    /// unreachable database or a corrupt snapshot.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let security = Arc::new(SecurityState::from_config(&config)?);

        let store = open_store(&config).await?;
        tracing::info!(backend = store.name(), "Metric store opened");
        let service = Arc::new(MetricService::new(store));

        let snapshot = if config.database_dsn.is_none() {
            let snapshot_config = SnapshotConfig {
                path: config.file_storage_path.clone(),
                interval: config.store_interval,
                restore: config.restore,
            };
            Some(SnapshotService::init(Arc::clone(&service), &snapshot_config).await?)
        } else {
            None
        };

        Ok(Self {
            config,
            service,
            security,
            snapshot,
        })
    }

    /// Metric service shared by both surfaces
    pub fn service(&self) -> &Arc<MetricService> {
        &self.service
    }

    /// Snapshot service, present in in-memory mode
    pub fn snapshot(&self) -> Option<&Arc<SnapshotService>> {
        self.snapshot.as_ref()
    }

    /// HTTP router with all guards applied
    pub fn router(&self) -> Router {
        create_http_router(Arc::clone(&self.service), Arc::clone(&self.security))
    }

    /// Bind the configured addresses and serve until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let http = TcpListener::bind(&self.config.address).await.map_err(|e| {
            TallyError::network(format!("Failed to bind HTTP server to {}: {}", self.config.address, e))
        })?;
        let grpc = match &self.config.grpc_address {
            Some(addr) => Some(TcpListener::bind(addr).await.map_err(|e| {
                TallyError::network(format!("Failed to bind GRPC server to {}: {}", addr, e))
            })?),
            None => None,
        };
        self.serve(http, grpc, shutdown).await
    }

    /// Serve on already bound listeners.
    ///
    /// Returns after `shutdown` fires or either server stops on its own; in
    /// both cases the snapshot is exported one last time.
    pub async fn serve(
        self,
        http: TcpListener,
        grpc: Option<TcpListener>,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        let (stop_trigger, stop) = ShutdownSignal::new();

        let backup = self
            .snapshot
            .as_ref()
            .map(|snapshot| tokio::spawn(Arc::clone(snapshot).run_backup_job(stop.clone())));

        tracing::info!("HTTP ingest listening on {}", http.local_addr()?);
        let app = self.router();
        let mut http_stop = stop.clone();
        let mut http_handle: JoinHandle<Result<()>> = tokio::spawn(async move {
            axum::serve(http, app)
                .with_graceful_shutdown(async move { http_stop.wait().await })
                .await
                .map_err(|e| TallyError::network(format!("HTTP server error: {}", e)))
        });

        let mut grpc_handle: Option<JoinHandle<Result<()>>> = match grpc {
            Some(listener) => {
                tracing::info!("GRPC ingest listening on {}", listener.local_addr()?);
                let incoming = TcpIncoming::from_listener(listener, true, None)
                    .map_err(|e| TallyError::network(format!("GRPC listener error: {}", e)))?;
                let svc = create_grpc_service(Arc::clone(&self.service), Arc::clone(&self.security));
                let mut grpc_stop = stop.clone();
                Some(tokio::spawn(async move {
                    Server::builder()
                        .add_service(svc)
                        .serve_with_incoming_shutdown(incoming, async move { grpc_stop.wait().await })
                        .await
                        .map_err(|e| TallyError::network(format!("GRPC server error: {}", e)))
                }))
            },
            None => None,
        };

        let mut failure: Option<TallyError> = None;
        {
            let grpc_done = async {
                match grpc_handle.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = shutdown.wait() => tracing::info!("Received shutdown signal, stopping servers"),
                res = &mut http_handle => {
                    tracing::warn!("HTTP server stopped unexpectedly");
                    failure = Some(flatten(res).err().unwrap_or_else(|| TallyError::internal("HTTP server exited")));
                },
                res = grpc_done => {
                    tracing::warn!("GRPC server stopped unexpectedly");
                    failure = Some(flatten(res).err().unwrap_or_else(|| TallyError::internal("GRPC server exited")));
                },
            }
        }

        stop_trigger.trigger();
        drain("HTTP", http_handle).await;
        if let Some(handle) = grpc_handle {
            drain("GRPC", handle).await;
        }
        if let Some(handle) = backup {
            drain_backup(handle).await;
        }
        if let Some(snapshot) = &self.snapshot {
            snapshot.close().await;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res?
}

async fn drain(name: &str, handle: JoinHandle<Result<()>>) {
    if handle.is_finished() {
        return;
    }
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(res) => {
            if let Err(e) = flatten(res) {
                tracing::error!("{} server failed during shutdown: {}", name, e);
            }
        },
        Err(_) => tracing::warn!("{} server did not stop within {:?}", name, DRAIN_TIMEOUT),
    }
}

async fn drain_backup(handle: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
        tracing::warn!("Backup job did not stop within {:?}", DRAIN_TIMEOUT);
    }
}
