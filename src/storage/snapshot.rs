//! File snapshots of the in-memory store.
//!
//! The snapshot is a JSON array of metric DTOs, truncated and rewritten on
//! every export. A non-zero interval exports from a background job; a zero
//! interval registers a write hook so every write is exported synchronously.

use crate::core::{MetricDto, Result, ShutdownSignal, TallyError};
use crate::metrics::{MetricService, WriteHook};
use crate::storage::MetricStore;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Resolution of the backup job clock.
const BACKUP_TICK: Duration = Duration::from_secs(1);

/// Snapshot file handle, held open for the lifetime of the service.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl SnapshotFile {
    /// Open the file read-write, creating it and its directory if missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| TallyError::storage(format!("open snapshot {}: {e}", path.display())))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the whole file. An empty file yields no metrics.
    pub async fn load(&self) -> Result<Vec<MetricDto>> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(0)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        if buf.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&buf).map_err(|e| {
            TallyError::storage(format!("corrupt snapshot {}: {e}", self.path.display()))
        })
    }

    /// Replace the file contents with every record of `store`.
    ///
    /// The file lock is taken before reading the store, so concurrent exports
    /// land in the order they observed the store.
    pub async fn export_from(&self, store: &dyn MetricStore) -> Result<usize> {
        let mut file = self.file.lock().await;
        let dtos: Vec<MetricDto> = store.get_all().await?.iter().map(MetricDto::from).collect();
        let json = serde_json::to_vec(&dtos)?;

        file.set_len(0).await?;
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(dtos.len())
    }
}

/// Exports on every write; installed when the store interval is zero.
struct SyncSnapshot {
    file: Arc<SnapshotFile>,
}

#[async_trait::async_trait]
impl WriteHook for SyncSnapshot {
    async fn on_write(&self, store: &dyn MetricStore) -> Result<()> {
        self.file.export_from(store).await.map(|_| ())
    }
}

/// Snapshot settings taken from the server configuration.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Snapshot file
    pub path: PathBuf,
    /// Export cadence; zero exports on every write
    pub interval: Duration,
    /// Import the file at startup
    pub restore: bool,
}

/// Periodic dump and restore of the metric store.
pub struct SnapshotService {
    service: Arc<MetricService>,
    file: Arc<SnapshotFile>,
    interval: Duration,
    last_export: Mutex<Instant>,
}

impl std::fmt::Debug for SnapshotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotService")
            .field("path", &self.file.path())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl SnapshotService {
    /// Open the snapshot file, restore it if requested and wire up
    /// synchronous exports for a zero interval.
    pub async fn init(service: Arc<MetricService>, config: &SnapshotConfig) -> Result<Arc<Self>> {
        let file = Arc::new(SnapshotFile::open(&config.path).await?);

        if config.restore {
            let dtos = file.load().await?;
            let restored = service.import_metrics(dtos).await?;
            info!(path = %config.path.display(), restored, "Restored metrics from snapshot");
        }

        if config.interval.is_zero() {
            service.add_write_hook(Arc::new(SyncSnapshot {
                file: Arc::clone(&file),
            }));
            info!(path = %config.path.display(), "Snapshot runs on every write");
        }

        Ok(Arc::new(Self {
            service,
            file,
            interval: config.interval,
            last_export: Mutex::new(Instant::now()),
        }))
    }

    /// Write the current store contents to the file.
    pub async fn export(&self) -> Result<usize> {
        let count = self.file.export_from(self.service.store().as_ref()).await?;
        *self.last_export.lock() = Instant::now();
        debug!(count, path = %self.file.path().display(), "Snapshot exported");
        Ok(count)
    }

    /// Final export; failures are logged.
    pub async fn close(&self) {
        match self.export().await {
            Ok(count) => info!(count, "Final snapshot written"),
            Err(e) => error!(category = e.category(), "Final snapshot failed: {}", e),
        }
    }

    fn is_due(&self) -> bool {
        self.last_export.lock().elapsed() >= self.interval
    }

    /// Export whenever the interval has elapsed, until shutdown.
    ///
    /// Returns immediately for a zero interval, where the write hook does
    /// the work.
    pub async fn run_backup_job(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        if self.interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(BACKUP_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_due() {
                        if let Err(e) = self.export().await {
                            warn!(category = e.category(), "Scheduled snapshot failed: {}", e);
                        }
                    }
                },
                () = shutdown.wait() => {
                    debug!("Backup job stopping");
                    return;
                },
            }
        }
    }
}
