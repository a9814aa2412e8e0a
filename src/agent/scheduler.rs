//! Tick-driven poll and report dispatch.
//!
//! A single ticker drives both timers. Due timers push a job into a
//! one-slot channel; a job that is still pending when the timer fires again
//! absorbs the new firing. Poll and report consumers run concurrently.

use super::collector::{reported_polls, Collector};
use super::sender::MetricSender;
use crate::core::{AgentConfig, Metric, Result, ShutdownSignal, ShutdownTrigger, TallyError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Collection cadence
    pub poll_interval: Duration,
    /// Send cadence
    pub report_interval: Duration,
    /// Concurrent send workers; 0 or 1 sends one batch request
    pub rate_limit: usize,
    /// Resolution of the shared ticker
    pub tick: Duration,
    /// Time allowed for in-flight jobs after shutdown
    pub shutdown_grace: Duration,
}

impl From<&AgentConfig> for SchedulerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            report_interval: config.report_interval,
            rate_limit: config.rate_limit,
            tick: Duration::from_secs(1),
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Next firing time of one logical timer.
#[derive(Debug)]
struct Timer {
    interval: Duration,
    next: Instant,
}

impl Timer {
    fn new(start: Instant, interval: Duration) -> Self {
        Self {
            interval,
            next: start + interval,
        }
    }

    /// Returns true if the timer fired, advancing it past `now`.
    fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        while self.next <= now {
            self.next += self.interval;
        }
        true
    }
}

/// Drives collection and reporting until shutdown.
pub struct Scheduler {
    collector: Arc<Collector>,
    sender: Arc<dyn MetricSender>,
    config: SchedulerConfig,
    cancel_sends: Option<ShutdownTrigger>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(collector: Arc<Collector>, sender: Arc<dyn MetricSender>, config: SchedulerConfig) -> Self {
        Self {
            collector,
            sender,
            config,
            cancel_sends: None,
        }
    }

    /// Trigger fired once the shutdown grace period has run out, cancelling
    /// the sender's pending retries.
    pub fn cancel_sends_with(mut self, trigger: ShutdownTrigger) -> Self {
        self.cancel_sends = Some(trigger);
        self
    }

    /// Run until `shutdown` fires, then drain in-flight jobs.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        if self.config.poll_interval.is_zero() || self.config.report_interval.is_zero() {
            return Err(TallyError::config("poll and report intervals must be greater than 0"));
        }
        info!(
            poll = ?self.config.poll_interval,
            report = ?self.config.report_interval,
            rate_limit = self.config.rate_limit,
            "Agent scheduler started"
        );

        let (poll_tx, poll_rx) = mpsc::channel::<()>(1);
        let (report_tx, report_rx) = mpsc::channel::<()>(1);
        let poll_task = tokio::spawn(poll_loop(Arc::clone(&self.collector), poll_rx));
        let report_task = tokio::spawn(report_loop(
            Arc::clone(&self.collector),
            Arc::clone(&self.sender),
            self.config.rate_limit,
            report_rx,
        ));

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let start = Instant::now();
        let mut poll_timer = Timer::new(start, self.config.poll_interval);
        let mut report_timer = Timer::new(start, self.config.report_interval);

        loop {
            tokio::select! {
                now = ticker.tick() => {
                    if poll_timer.poll(now) && poll_tx.try_send(()).is_err() {
                        debug!("Poll still pending, firing coalesced");
                    }
                    if report_timer.poll(now) && report_tx.try_send(()).is_err() {
                        debug!("Report still pending, firing coalesced");
                    }
                },
                () = shutdown.wait() => break,
            }
        }

        info!("Shutdown requested, draining in-flight jobs");
        drop(poll_tx);
        drop(report_tx);
        self.drain(poll_task, report_task).await;
        Ok(())
    }

    async fn drain(&self, poll_task: JoinHandle<()>, report_task: JoinHandle<()>) {
        let poll_abort = poll_task.abort_handle();
        let report_abort = report_task.abort_handle();
        let both = async {
            let _ = poll_task.await;
            let _ = report_task.await;
        };
        tokio::pin!(both);

        if tokio::time::timeout(self.config.shutdown_grace, &mut both).await.is_ok() {
            return;
        }
        warn!(grace = ?self.config.shutdown_grace, "In-flight jobs outlived the grace period, cancelling");
        if let Some(trigger) = &self.cancel_sends {
            trigger.trigger();
        }
        if tokio::time::timeout(Duration::from_secs(1), &mut both).await.is_err() {
            poll_abort.abort();
            report_abort.abort();
        }
    }
}

async fn poll_loop(collector: Arc<Collector>, mut jobs: mpsc::Receiver<()>) {
    while jobs.recv().await.is_some() {
        if let Err(e) = collector.collect_all().await {
            error!(category = e.category(), "Collection failed: {}", e);
        }
    }
}

async fn report_loop(
    collector: Arc<Collector>,
    sender: Arc<dyn MetricSender>,
    rate_limit: usize,
    mut jobs: mpsc::Receiver<()>,
) {
    while jobs.recv().await.is_some() {
        if let Err(e) = report_once(&collector, &sender, rate_limit).await {
            error!(category = e.category(), "Report failed: {}", e);
        }
    }
}

/// Snapshot the state, send it and acknowledge the reported polls.
///
/// `PollCount` is only reduced after every send has succeeded.
pub async fn report_once(
    collector: &Collector,
    sender: &Arc<dyn MetricSender>,
    rate_limit: usize,
) -> Result<()> {
    let batch = collector.snapshot();
    let sent_polls = reported_polls(&batch);
    let count = batch.len();

    send_stage(sender, batch, rate_limit).await?;
    collector.commit_report(sent_polls);
    debug!(count, sent_polls, "Report delivered");
    Ok(())
}

/// Deliver a batch: one request, or one request per metric over a pool of
/// `rate_limit` workers.
///
/// The first worker error is returned; remaining workers stop once they
/// notice nobody collects their results.
pub async fn send_stage(
    sender: &Arc<dyn MetricSender>,
    batch: Vec<Metric>,
    rate_limit: usize,
) -> Result<()> {
    if rate_limit <= 1 {
        return sender.send_batch(&batch).await;
    }
    if batch.is_empty() {
        return Ok(());
    }

    let (job_tx, job_rx) = mpsc::channel::<Metric>(rate_limit);
    let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<Result<()>>(rate_limit);

    for worker in 0..rate_limit {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let sender = Arc::clone(sender);
        tokio::spawn(async move {
            loop {
                let job = job_rx.lock().await.recv().await;
                let Some(metric) = job else { break };
                let result = sender.send_one(&metric).await;
                if let Err(e) = &result {
                    debug!(worker, metric = %metric.name, "Send failed: {}", e);
                }
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let expected = batch.len();
    tokio::spawn(async move {
        for metric in batch {
            if job_tx.send(metric).await.is_err() {
                break;
            }
        }
    });

    let mut delivered = 0;
    while let Some(result) = result_rx.recv().await {
        result?;
        delivered += 1;
    }
    if delivered < expected {
        return Err(TallyError::internal(format!(
            "only {delivered} of {expected} metrics were sent"
        )));
    }
    Ok(())
}
