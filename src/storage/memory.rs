//! In-memory metric store.
//!
//! Records live in a single map keyed by `name-type` behind a read/write
//! lock. Transactions hold the write lock for their whole lifetime and
//! stage writes until commit.

use super::{MetricStore, StoreTx};
use crate::core::types::storage_key;
use crate::core::{Metric, MetricKind, Result, TallyError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

type MetricMap = HashMap<String, Metric>;

/// Process-local metric store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    metrics: Arc<RwLock<MetricMap>>,
}

impl InMemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.metrics.read().await.len()
    }

    /// Returns true if nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.metrics.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl MetricStore for InMemoryStorage {
    async fn create(&self, metric: &Metric) -> Result<()> {
        let mut map = self.metrics.write().await;
        let key = metric.key();
        if map.contains_key(&key) {
            return Err(TallyError::AlreadyExists(key));
        }
        map.insert(key, metric.clone());
        Ok(())
    }

    async fn read(&self, kind: MetricKind, name: &str) -> Result<Metric> {
        let key = storage_key(kind, name);
        self.metrics
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(TallyError::NotFound(key))
    }

    async fn update(&self, metric: &Metric) -> Result<()> {
        let mut map = self.metrics.write().await;
        match map.get_mut(&metric.key()) {
            Some(slot) => {
                *slot = metric.clone();
                Ok(())
            },
            None => Err(TallyError::NotFound(metric.key())),
        }
    }

    async fn get_all(&self) -> Result<Vec<Metric>> {
        let mut all: Vec<Metric> = self.metrics.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.kind().cmp(&b.kind())));
        Ok(all)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.metrics).write_owned().await;
        Ok(Box::new(MemoryTx {
            guard,
            staged: HashMap::new(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Transaction over [`InMemoryStorage`].
struct MemoryTx {
    guard: OwnedRwLockWriteGuard<MetricMap>,
    staged: MetricMap,
}

impl MemoryTx {
    fn lookup(&self, key: &str) -> Option<&Metric> {
        self.staged.get(key).or_else(|| self.guard.get(key))
    }
}

#[async_trait::async_trait]
impl StoreTx for MemoryTx {
    async fn create(&mut self, metric: &Metric) -> Result<()> {
        let key = metric.key();
        if self.lookup(&key).is_some() {
            return Err(TallyError::AlreadyExists(key));
        }
        self.staged.insert(key, metric.clone());
        Ok(())
    }

    async fn read(&mut self, kind: MetricKind, name: &str) -> Result<Metric> {
        let key = storage_key(kind, name);
        self.lookup(&key).cloned().ok_or(TallyError::NotFound(key))
    }

    async fn update(&mut self, metric: &Metric) -> Result<()> {
        let key = metric.key();
        if self.lookup(&key).is_none() {
            return Err(TallyError::NotFound(key));
        }
        self.staged.insert(key, metric.clone());
        Ok(())
    }

    async fn bulk_create_or_update(&mut self, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            self.staged.insert(metric.key(), metric.clone());
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, staged } = *self;
        guard.extend(staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
