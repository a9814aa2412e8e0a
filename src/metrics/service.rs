//! Metric service: typed updates over a [`MetricStore`].
//!
//! Gauges are replaced, counters accumulate. Counter read-modify-write
//! cycles run inside a store transaction, which holds back concurrent
//! writers until commit.

use crate::core::{Metric, MetricDto, MetricKind, MetricValue, Result, TallyError};
use crate::storage::{MetricStore, StoreTx};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Callback invoked after every successful write.
#[async_trait::async_trait]
pub trait WriteHook: Send + Sync {
    /// Called once per completed write operation.
    async fn on_write(&self, store: &dyn MetricStore) -> Result<()>;
}

/// Service layer shared by the HTTP and RPC entry points.
pub struct MetricService {
    store: Arc<dyn MetricStore>,
    hooks: RwLock<Vec<Arc<dyn WriteHook>>>,
}

impl std::fmt::Debug for MetricService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricService")
            .field("store", &self.store.name())
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

fn counter_total(metric: &Metric) -> Result<i64> {
    match metric.value {
        MetricValue::Counter(total) => Ok(total),
        MetricValue::Gauge(_) => Err(TallyError::internal(format!(
            "store returned a gauge for counter {}",
            metric.name
        ))),
    }
}

fn add_delta(name: &str, total: i64, delta: i64) -> Result<i64> {
    total
        .checked_add(delta)
        .ok_or_else(|| TallyError::value_parse(format!("counter {name} overflows i64")))
}

/// Read the current total of a counter inside a transaction, zero if absent.
async fn current_total(tx: &mut dyn StoreTx, name: &str) -> Result<Option<i64>> {
    match tx.read(MetricKind::Counter, name).await {
        Ok(metric) => counter_total(&metric).map(Some),
        Err(TallyError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn finish<T>(tx: Box<dyn StoreTx>, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        },
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!("Rollback failed: {}", rollback_err);
            }
            Err(e)
        },
    }
}

/// Collapse a batch: counters with the same name are summed, gauges keep the
/// last write. Order of first appearance is preserved.
fn normalize_batch(metrics: Vec<Metric>) -> Result<Vec<Metric>> {
    let mut slots: HashMap<(MetricKind, String), usize> = HashMap::new();
    let mut merged: Vec<Metric> = Vec::with_capacity(metrics.len());

    for metric in metrics {
        if metric.name.is_empty() {
            return Err(TallyError::EmptyName);
        }
        if let MetricValue::Gauge(v) = metric.value {
            MetricValue::gauge(&metric.name, v)?;
        }
        let slot_key = (metric.kind(), metric.name.clone());
        match slots.get(&slot_key) {
            Some(&idx) => {
                let slot = &mut merged[idx];
                slot.value = match (slot.value, metric.value) {
                    (MetricValue::Counter(sum), MetricValue::Counter(delta)) => {
                        MetricValue::Counter(add_delta(&metric.name, sum, delta)?)
                    },
                    (_, latest) => latest,
                };
            },
            None => {
                slots.insert(slot_key, merged.len());
                merged.push(metric);
            },
        }
    }
    Ok(merged)
}

impl MetricService {
    /// Create a service over the given store
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self {
            store,
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    /// Register a hook run after every write
    pub fn add_write_hook(&self, hook: Arc<dyn WriteHook>) {
        self.hooks.write().push(hook);
    }

    async fn notify_write(&self) {
        let hooks: Vec<Arc<dyn WriteHook>> = self.hooks.read().clone();
        for hook in hooks {
            if let Err(e) = hook.on_write(self.store.as_ref()).await {
                error!(category = e.category(), "Write hook failed: {}", e);
            }
        }
    }

    /// Parse the URL form of an update and apply it.
    pub async fn set_metric(&self, kind: &str, name: &str, raw: &str) -> Result<Metric> {
        let kind: MetricKind = kind.parse()?;
        if name.is_empty() {
            return Err(TallyError::EmptyName);
        }
        match MetricValue::parse(kind, raw)? {
            MetricValue::Gauge(v) => self.set_gauge(name, v).await,
            MetricValue::Counter(d) => self.set_counter(name, d).await,
        }
    }

    /// Store a gauge, replacing any previous value.
    pub async fn set_gauge(&self, name: &str, value: f64) -> Result<Metric> {
        let metric = Metric::new(name, MetricValue::Gauge(value))?;
        match self.store.create(&metric).await {
            Ok(()) => {},
            Err(TallyError::AlreadyExists(_)) => self.store.update(&metric).await?,
            Err(e) => return Err(e),
        }
        debug!(metric = %metric.name, value, "Gauge stored");
        self.notify_write().await;
        Ok(metric)
    }

    /// Add `delta` to a counter and return the new total.
    pub async fn set_counter(&self, name: &str, delta: i64) -> Result<Metric> {
        let metric = Metric::new(name, MetricValue::Counter(delta))?;
        let mut tx = self.store.begin().await?;
        let outcome = Self::accumulate(tx.as_mut(), metric).await;
        let stored = finish(tx, outcome).await?;
        debug!(metric = %stored.name, delta, total = %stored.value, "Counter stored");
        self.notify_write().await;
        Ok(stored)
    }

    async fn accumulate(tx: &mut dyn StoreTx, metric: Metric) -> Result<Metric> {
        let delta = counter_total(&metric)?;
        match current_total(tx, &metric.name).await? {
            Some(total) => {
                let total = add_delta(&metric.name, total, delta)?;
                let stored = Metric::counter(metric.name, total);
                tx.update(&stored).await?;
                Ok(stored)
            },
            None => {
                tx.create(&metric).await?;
                Ok(metric)
            },
        }
    }

    /// Apply a decoded DTO and return it with the persisted value.
    pub async fn set_metric_by_dto(&self, dto: MetricDto) -> Result<MetricDto> {
        let metric = Metric::try_from(dto)?;
        let stored = match metric.value {
            MetricValue::Gauge(v) => self.set_gauge(&metric.name, v).await?,
            MetricValue::Counter(d) => self.set_counter(&metric.name, d).await?,
        };
        Ok(stored.to_dto())
    }

    /// Apply a batch in one transaction.
    ///
    /// Counters sharing a name are pre-summed into one delta and gauges keep
    /// the last write, so order within the batch does not matter. The
    /// returned metrics carry the persisted totals.
    pub async fn set_metrics(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>> {
        let batch = normalize_batch(metrics)?;
        if batch.is_empty() {
            return Ok(batch);
        }

        let mut tx = self.store.begin().await?;
        let outcome = Self::apply_batch(tx.as_mut(), batch).await;
        let stored = finish(tx, outcome).await?;
        debug!(count = stored.len(), "Batch stored");
        self.notify_write().await;
        Ok(stored)
    }

    async fn apply_batch(tx: &mut dyn StoreTx, batch: Vec<Metric>) -> Result<Vec<Metric>> {
        let mut resolved = Vec::with_capacity(batch.len());
        for metric in batch {
            match metric.value {
                MetricValue::Counter(delta) => {
                    let total = current_total(tx, &metric.name).await?.unwrap_or(0);
                    let total = add_delta(&metric.name, total, delta)?;
                    resolved.push(Metric::counter(metric.name, total));
                },
                MetricValue::Gauge(_) => resolved.push(metric),
            }
        }
        tx.bulk_create_or_update(&resolved).await?;
        Ok(resolved)
    }

    /// Apply a batch of DTOs.
    pub async fn set_metrics_by_dto(&self, dtos: Vec<MetricDto>) -> Result<Vec<MetricDto>> {
        let metrics = dtos
            .into_iter()
            .map(Metric::try_from)
            .collect::<Result<Vec<_>>>()?;
        let stored = self.set_metrics(metrics).await?;
        Ok(stored.iter().map(MetricDto::from).collect())
    }

    /// Formatted value of a metric.
    pub async fn get_value_as_string(&self, kind: MetricKind, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(TallyError::EmptyName);
        }
        Ok(self.store.read(kind, name).await?.value.to_string())
    }

    /// Full DTO of a metric.
    pub async fn get_metric_as_dto(&self, kind: MetricKind, name: &str) -> Result<MetricDto> {
        if name.is_empty() {
            return Err(TallyError::EmptyName);
        }
        Ok(self.store.read(kind, name).await?.to_dto())
    }

    /// Every metric as `(name, formatted value)`, ordered by name then kind.
    ///
    /// A gauge and a counter sharing a name both appear.
    pub async fn get_all_values_as_string(&self) -> Result<Vec<(String, String)>> {
        let mut all = self.store.get_all().await?;
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.kind().cmp(&b.kind())));
        Ok(all
            .into_iter()
            .map(|m| {
                let formatted = m.value.to_string();
                (m.name, formatted)
            })
            .collect())
    }

    /// Every stored metric as DTOs, for snapshots.
    pub async fn export_metrics(&self) -> Result<Vec<MetricDto>> {
        Ok(self.store.get_all().await?.iter().map(MetricDto::from).collect())
    }

    /// Upsert snapshot contents verbatim; counters are restored as totals.
    pub async fn import_metrics(&self, dtos: Vec<MetricDto>) -> Result<usize> {
        let metrics = dtos
            .into_iter()
            .map(Metric::try_from)
            .collect::<Result<Vec<_>>>()?;
        let count = metrics.len();
        if count > 0 {
            self.store.bulk_create_or_update(&metrics).await?;
        }
        Ok(count)
    }

    /// Health check of the backing store
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> MetricService {
        MetricService::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_counter_accumulates() {
        let svc = service();
        for _ in 0..3 {
            svc.set_counter("hits", 3).await.unwrap();
        }
        assert_eq!(
            svc.get_value_as_string(MetricKind::Counter, "hits").await.unwrap(),
            "9"
        );
    }

    #[tokio::test]
    async fn test_gauge_replaces() {
        let svc = service();
        svc.set_gauge("temp", 1.5).await.unwrap();
        svc.set_gauge("temp", -0.5).await.unwrap();
        assert_eq!(
            svc.get_value_as_string(MetricKind::Gauge, "temp").await.unwrap(),
            "-0.5"
        );
    }

    #[tokio::test]
    async fn test_set_metric_url_form() {
        let svc = service();
        svc.set_metric("counter", "c", "5").await.unwrap();
        assert!(matches!(
            svc.set_metric("histogram", "c", "5").await,
            Err(TallyError::UnknownMetricType(_))
        ));
        assert!(matches!(
            svc.set_metric("gauge", "", "1").await,
            Err(TallyError::EmptyName)
        ));
        assert!(matches!(
            svc.set_metric("counter", "c", "1.5").await,
            Err(TallyError::ValueParse(_))
        ));
    }

    #[tokio::test]
    async fn test_non_finite_gauge_not_stored() {
        let svc = service();
        for raw in ["NaN", "inf", "-inf"] {
            assert!(matches!(
                svc.set_metric("gauge", "x", raw).await,
                Err(TallyError::ValueParse(_))
            ));
        }
        assert!(matches!(
            svc.set_gauge("x", f64::NAN).await,
            Err(TallyError::ValueParse(_))
        ));
        assert!(matches!(
            svc.set_metrics(vec![Metric::counter("c", 1), Metric::gauge("x", f64::INFINITY)])
                .await,
            Err(TallyError::ValueParse(_))
        ));
        assert!(svc.export_metrics().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_pre_sums_counters() {
        let svc = service();
        svc.set_counter("c", 10).await.unwrap();
        let stored = svc
            .set_metrics(vec![
                Metric::counter("c", 1),
                Metric::gauge("g", 1.0),
                Metric::counter("c", 2),
                Metric::gauge("g", 2.0),
            ])
            .await
            .unwrap();
        assert_eq!(stored, vec![Metric::counter("c", 13), Metric::gauge("g", 2.0)]);
    }

    #[tokio::test]
    async fn test_dto_without_payload_rejected() {
        let svc = service();
        let dto = MetricDto::query(MetricKind::Counter, "c");
        assert!(matches!(
            svc.set_metric_by_dto(dto).await,
            Err(TallyError::ValueParse(_))
        ));
    }

    #[tokio::test]
    async fn test_all_values_lists_both_kinds() {
        let svc = service();
        svc.set_gauge("b", 2.5).await.unwrap();
        svc.set_counter("a", 1).await.unwrap();
        svc.set_gauge("a", 0.5).await.unwrap();
        assert_eq!(
            svc.get_all_values_as_string().await.unwrap(),
            vec![
                ("a".to_string(), "0.5".to_string()),
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2.5".to_string()),
            ]
        );
    }

    struct CountingHook(AtomicUsize);

    #[async_trait::async_trait]
    impl WriteHook for CountingHook {
        async fn on_write(&self, _store: &dyn MetricStore) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_hook_runs_per_write() {
        let svc = service();
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        svc.add_write_hook(hook.clone());

        svc.set_gauge("g", 1.0).await.unwrap();
        svc.set_counter("c", 1).await.unwrap();
        svc.set_metrics(vec![Metric::gauge("g", 2.0)]).await.unwrap();
        let _ = svc.set_metric("gauge", "g", "oops").await;

        assert_eq!(hook.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_import_then_export() {
        let svc = service();
        svc.import_metrics(vec![Metric::counter("x", 7).to_dto()]).await.unwrap();
        svc.set_counter("x", 5).await.unwrap();
        assert_eq!(
            svc.export_metrics().await.unwrap(),
            vec![Metric::counter("x", 12).to_dto()]
        );
    }
}
