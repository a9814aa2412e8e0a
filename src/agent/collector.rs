//! Agent state and the collection cycle.

use super::alloc::AllocStatsSource;
use super::sampler::{HostSampler, ProcessSampler, Sampler};
use crate::core::{Metric, MetricValue, Result, TallyError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Counter of successful collections since the last successful report.
pub const POLL_COUNT: &str = "PollCount";

/// Gauge reseeded with a uniform random draw every cycle.
pub const RANDOM_VALUE: &str = "RandomValue";

type SampleResult = (&'static str, Result<Vec<Metric>>);

/// Samples every source and keeps the latest reading per metric name.
pub struct Collector {
    samplers: Vec<Arc<dyn Sampler>>,
    state: Mutex<HashMap<String, MetricValue>>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("samplers", &self.samplers.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("metrics", &self.state.lock().len())
            .finish()
    }
}

impl Collector {
    /// Create a collector over the given samplers.
    pub fn new(samplers: Vec<Arc<dyn Sampler>>) -> Self {
        let mut state = HashMap::new();
        state.insert(POLL_COUNT.to_string(), MetricValue::Counter(0));
        state.insert(RANDOM_VALUE.to_string(), MetricValue::Gauge(0.0));
        Self {
            samplers,
            state: Mutex::new(state),
        }
    }

    /// Process and host samplers.
    pub fn with_default_samplers(alloc: &'static dyn AllocStatsSource) -> Self {
        Self::new(vec![
            Arc::new(ProcessSampler::new(alloc)),
            Arc::new(HostSampler::new()),
        ])
    }

    /// Run one collection cycle.
    ///
    /// Samplers run concurrently and report over a single channel. The first
    /// failure aborts the cycle and leaves the state untouched.
    pub async fn collect_all(&self) -> Result<()> {
        let expected = self.samplers.len();
        let (tx, mut rx) = mpsc::channel::<SampleResult>(1);

        for sampler in &self.samplers {
            let sampler = Arc::clone(sampler);
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || {
                let result = sampler.sample();
                // Receiver gone means the cycle was already aborted.
                let _ = tx.blocking_send((sampler.name(), result));
            });
        }
        drop(tx);

        let mut readings = Vec::new();
        let mut received = 0;
        while let Some((name, result)) = rx.recv().await {
            received += 1;
            match result {
                Ok(metrics) => readings.extend(metrics),
                Err(e) => {
                    warn!(sampler = name, category = e.category(), "Sampler failed: {}", e);
                    return Err(e);
                },
            }
        }
        if received < expected {
            return Err(TallyError::internal(format!(
                "{} of {} samplers did not report",
                expected - received,
                expected
            )));
        }

        let mut state = self.state.lock();
        for metric in readings {
            state.insert(metric.name, metric.value);
        }
        let polls = match state.get(POLL_COUNT) {
            Some(MetricValue::Counter(n)) => n.saturating_add(1),
            _ => 1,
        };
        state.insert(POLL_COUNT.to_string(), MetricValue::Counter(polls));
        state.insert(RANDOM_VALUE.to_string(), MetricValue::Gauge(rand::random::<f64>()));
        debug!(metrics = state.len(), poll_count = polls, "Collection cycle complete");
        Ok(())
    }

    /// Copy of the current state, ordered by name.
    pub fn snapshot(&self) -> Vec<Metric> {
        let state = self.state.lock();
        let mut metrics: Vec<Metric> = state
            .iter()
            .map(|(name, value)| Metric {
                name: name.clone(),
                value: *value,
            })
            .collect();
        drop(state);
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Current `PollCount`.
    pub fn poll_count(&self) -> i64 {
        match self.state.lock().get(POLL_COUNT) {
            Some(MetricValue::Counter(n)) => *n,
            _ => 0,
        }
    }

    /// Acknowledge a successful report that carried `sent` polls.
    ///
    /// Only the reported polls are subtracted; cycles that completed while
    /// the report was in flight are kept for the next one.
    pub fn commit_report(&self, sent: i64) {
        let mut state = self.state.lock();
        let remaining = match state.get(POLL_COUNT) {
            Some(MetricValue::Counter(n)) => n.saturating_sub(sent).max(0),
            _ => 0,
        };
        state.insert(POLL_COUNT.to_string(), MetricValue::Counter(remaining));
    }
}

/// `PollCount` carried by a report batch.
pub fn reported_polls(batch: &[Metric]) -> i64 {
    batch
        .iter()
        .find_map(|m| match m.value {
            MetricValue::Counter(n) if m.name == POLL_COUNT => Some(n),
            _ => None,
        })
        .unwrap_or(0)
}
