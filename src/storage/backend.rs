//! Storage backend traits.

use crate::core::{Metric, MetricKind, Result};

/// Trait for metric store implementations.
///
/// Records are keyed by `(name, kind)`. Single-record operations are
/// individually atomic; multi-step updates go through [`MetricStore::begin`].
#[async_trait::async_trait]
pub trait MetricStore: Send + Sync {
    /// Insert a new record; fails with `AlreadyExists` if the key is taken.
    async fn create(&self, metric: &Metric) -> Result<()>;

    /// Read a record; fails with `NotFound` if absent.
    async fn read(&self, kind: MetricKind, name: &str) -> Result<Metric>;

    /// Replace an existing record; fails with `NotFound` if absent.
    async fn update(&self, metric: &Metric) -> Result<()>;

    /// Snapshot of every record.
    async fn get_all(&self) -> Result<Vec<Metric>>;

    /// Start a transaction.
    ///
    /// Writes made through the transaction become visible on commit and are
    /// discarded on rollback. While a transaction is open, other writers are
    /// held back, which serializes read-modify-write cycles.
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    /// Check that the backend answers.
    async fn ping(&self) -> Result<()>;

    /// Upsert many records atomically.
    async fn bulk_create_or_update(&self, metrics: &[Metric]) -> Result<()> {
        let mut tx = self.begin().await?;
        match tx.bulk_create_or_update(metrics).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!("Rollback after failed bulk upsert failed: {}", rollback_err);
                }
                Err(e)
            },
        }
    }

    /// Human readable backend name for logs.
    fn name(&self) -> &'static str;
}

/// An open transaction on a [`MetricStore`].
#[async_trait::async_trait]
pub trait StoreTx: Send {
    /// Insert within the transaction
    async fn create(&mut self, metric: &Metric) -> Result<()>;

    /// Read within the transaction, observing its own uncommitted writes
    async fn read(&mut self, kind: MetricKind, name: &str) -> Result<Metric>;

    /// Replace within the transaction
    async fn update(&mut self, metric: &Metric) -> Result<()>;

    /// Insert or replace every record
    async fn bulk_create_or_update(&mut self, metrics: &[Metric]) -> Result<()>;

    /// Make the writes durable and release the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard the writes and release the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}
