//! Metric sources polled by the collector.

use super::alloc::{AllocStats, AllocStatsSource};
use crate::core::{Metric, Result};
use parking_lot::Mutex;
use sysinfo::System;

/// A blocking metric source.
///
/// `sample` may block on OS calls; the collector runs it on the blocking
/// thread pool.
pub trait Sampler: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Take one reading
    fn sample(&self) -> Result<Vec<Metric>>;
}

/// Names of the process gauges, in reporting order.
pub const PROCESS_GAUGES: [&str; 27] = [
    "Alloc",
    "BuckHashSys",
    "Frees",
    "GCCPUFraction",
    "GCSys",
    "HeapAlloc",
    "HeapIdle",
    "HeapInuse",
    "HeapObjects",
    "HeapReleased",
    "HeapSys",
    "LastGC",
    "Lookups",
    "MCacheInuse",
    "MCacheSys",
    "MSpanInuse",
    "MSpanSys",
    "Mallocs",
    "NextGC",
    "NumForcedGC",
    "NumGC",
    "OtherSys",
    "PauseTotalNs",
    "StackInuse",
    "StackSys",
    "Sys",
    "TotalAlloc",
];

/// Allocator statistics of the agent process.
///
/// Heap figures come from the counting allocator. The process has no
/// garbage collector, so collector gauges and the allocator-internal
/// breakdowns without a counterpart report `0`.
pub struct ProcessSampler {
    source: &'static dyn AllocStatsSource,
}

impl ProcessSampler {
    /// Sample from the given allocator
    pub fn new(source: &'static dyn AllocStatsSource) -> Self {
        Self { source }
    }

    #[allow(clippy::cast_precision_loss)]
    fn reading(stats: &AllocStats, name: &str) -> f64 {
        let value = match name {
            "Alloc" | "HeapAlloc" | "HeapInuse" => stats.live_bytes,
            "TotalAlloc" => stats.total_bytes,
            "Mallocs" => stats.mallocs,
            "Frees" => stats.frees,
            "HeapObjects" => stats.live_objects(),
            "HeapSys" | "Sys" => stats.peak_bytes,
            "HeapIdle" => stats.peak_bytes.saturating_sub(stats.live_bytes),
            _ => 0,
        };
        value as f64
    }
}

impl Sampler for ProcessSampler {
    fn name(&self) -> &'static str {
        "process"
    }

    fn sample(&self) -> Result<Vec<Metric>> {
        let stats = self.source.alloc_stats();
        Ok(PROCESS_GAUGES
            .iter()
            .map(|name| Metric::gauge(*name, Self::reading(&stats, name)))
            .collect())
    }
}

/// Virtual memory and per-CPU utilisation of the host.
///
/// CPU usage is the delta between two refreshes, so the `System` handle is
/// kept across polls.
pub struct HostSampler {
    system: Mutex<System>,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    /// Create the sampler and take the baseline CPU reading
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_all();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Sampler for HostSampler {
    fn name(&self) -> &'static str {
        "host"
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample(&self) -> Result<Vec<Metric>> {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let mut metrics = Vec::with_capacity(system.cpus().len() + 2);
        metrics.push(Metric::gauge("TotalMemory", system.total_memory() as f64));
        metrics.push(Metric::gauge("FreeMemory", system.free_memory() as f64));
        for (idx, cpu) in system.cpus().iter().enumerate() {
            metrics.push(Metric::gauge(
                format!("CPUutilization{}", idx + 1),
                // `max` maps a NaN reading to 0.
                f64::from(cpu.cpu_usage().max(0.0)),
            ));
        }
        Ok(metrics)
    }
}
