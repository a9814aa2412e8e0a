//! Metric stores.
//!
//! [`MetricStore`] abstracts over the in-memory map and the SQLite database.
//! The snapshot service persists the in-memory store to a file when no
//! database is configured.

pub mod backend;
pub mod memory;
pub mod snapshot;
pub mod sqlite;

pub use backend::{MetricStore, StoreTx};
pub use memory::InMemoryStorage;
pub use snapshot::{SnapshotConfig, SnapshotFile, SnapshotService};
pub use sqlite::{PoolConfig, SqliteStorage};

use crate::core::{Result, ServerConfig};
use std::sync::Arc;

/// Build the store selected by the configuration.
pub async fn open_store(config: &ServerConfig) -> Result<Arc<dyn MetricStore>> {
    match config.database_dsn.as_deref() {
        Some(dsn) => {
            let pool = PoolConfig {
                min_connections: config.db_pool_min,
                max_connections: config.db_pool_max,
                ..PoolConfig::default()
            };
            Ok(Arc::new(SqliteStorage::open(dsn, &pool).await?))
        },
        None => Ok(Arc::new(InMemoryStorage::new())),
    }
}
