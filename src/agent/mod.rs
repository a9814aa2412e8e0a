//! Metrics agent: periodic collection and concurrent dispatch.
//!
//! - `alloc`: counting allocator feeding the process sampler
//! - `sampler`: process and host metric sources
//! - `collector`: agent state and the collection cycle
//! - `sender`: HTTP and RPC transports with retries
//! - `scheduler`: tick-driven poll/report dispatch and the worker pool

pub mod alloc;
pub mod collector;
pub mod sampler;
pub mod scheduler;
pub mod sender;

pub use alloc::{AllocStats, AllocStatsSource, CountingAllocator, NoAllocStats};
pub use collector::{Collector, POLL_COUNT, RANDOM_VALUE};
pub use sampler::{HostSampler, ProcessSampler, Sampler};
pub use scheduler::{report_once, send_stage, Scheduler, SchedulerConfig};
pub use sender::{GrpcSender, HttpSender, MetricSender};

use crate::core::{AgentConfig, Result, ShutdownSignal};
use std::sync::Arc;

/// A configured agent, ready to run.
#[derive(Debug)]
pub struct Agent {
    scheduler: Scheduler,
}

impl Agent {
    /// Build the agent.
    ///
    /// Reports go over RPC when `grpc_address` is set, otherwise over HTTP.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: &AgentConfig, alloc: &'static dyn AllocStatsSource) -> Result<Self> {
        config.validate()?;
        let (cancel_sends, transport_signal) = ShutdownSignal::new();

        let sender: Arc<dyn MetricSender> = match config.grpc_address.as_deref() {
            Some(address) => {
                tracing::info!(address, "Reporting over GRPC");
                Arc::new(GrpcSender::new(config, address, transport_signal)?)
            },
            None => {
                tracing::info!(address = %config.base_url(), "Reporting over HTTP");
                Arc::new(HttpSender::new(config, transport_signal)?)
            },
        };

        let collector = Arc::new(Collector::with_default_samplers(alloc));
        let scheduler = Scheduler::new(collector, sender, SchedulerConfig::from(config))
            .cancel_sends_with(cancel_sends);
        Ok(Self { scheduler })
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        self.scheduler.run(shutdown).await
    }
}
