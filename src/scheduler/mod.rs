//! Scheduler module: one poll loop per monitored domain.

mod retention;
mod state;

pub use retention::*;
pub use state::*;

use crate::collector::{CollectError, Collector};
use crate::config::ScheduleConfig;
use crate::engine::{CycleReport, DiffEngine};

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Poll error types.
#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error("state update failed for all {0} entities")]
    Apply(usize),
    #[error("poll task aborted: {0}")]
    Panicked(String),
}

/// Collect-then-apply for one domain.
pub struct Pipeline {
    collector: Collector,
    engine: DiffEngine,
}

impl Pipeline {
    pub fn new(collector: Collector, engine: DiffEngine) -> Self {
        Self { collector, engine }
    }

    pub fn engine(&self) -> &DiffEngine {
        &self.engine
    }

    pub async fn poll(&self, domain: Domain) -> Result<CycleReport, PollError> {
        let report = match domain {
            Domain::Bgp => {
                let snapshot = self.collector.collect_bgp().await?;
                self.engine.apply_bgp_snapshot(&snapshot).await
            }
            Domain::Interfaces => {
                let snapshot = self.collector.collect_interfaces().await?;
                self.engine.apply_interface_snapshot(&snapshot).await
            }
        };

        if report.applied == 0 && report.failed > 0 {
            return Err(PollError::Apply(report.failed));
        }
        Ok(report)
    }
}

/// Counters for one domain loop.
#[derive(Debug, Default)]
pub struct DomainStats {
    polls_started: AtomicU64,
    polls_succeeded: AtomicU64,
    polls_failed: AtomicU64,
    ticks_skipped: AtomicU64,
}

impl DomainStats {
    pub fn polls_started(&self) -> u64 {
        self.polls_started.load(Ordering::Relaxed)
    }

    pub fn polls_succeeded(&self) -> u64 {
        self.polls_succeeded.load(Ordering::Relaxed)
    }

    pub fn polls_failed(&self) -> u64 {
        self.polls_failed.load(Ordering::Relaxed)
    }

    /// Ticks dropped because the previous poll was still running.
    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::Relaxed)
    }
}

/// Drives the BGP and interface poll loops.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    config: ScheduleConfig,
    stop_tx: broadcast::Sender<()>,
    bgp_stats: Arc<DomainStats>,
    interface_stats: Arc<DomainStats>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, config: ScheduleConfig) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            pipeline,
            config,
            stop_tx,
            bgp_stats: Arc::new(DomainStats::default()),
            interface_stats: Arc::new(DomainStats::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self, domain: Domain) -> Arc<DomainStats> {
        match domain {
            Domain::Bgp => self.bgp_stats.clone(),
            Domain::Interfaces => self.interface_stats.clone(),
        }
    }

    /// Start both domain loops.
    pub async fn start(&self) {
        let policy = BackoffPolicy::new(self.config.backoff_base, self.config.backoff_max);
        let domains = [
            (Domain::Bgp, self.config.bgp_interval),
            (Domain::Interfaces, self.config.interface_interval),
        ];

        let mut handles = self.handles.lock().await;
        for (domain, interval) in domains {
            tracing::info!("Scheduler: polling {} every {:?}", domain, interval);
            handles.push(tokio::spawn(run_domain_loop(
                domain,
                interval,
                policy,
                self.pipeline.clone(),
                self.stats(domain),
                self.stop_tx.subscribe(),
            )));
        }
    }

    /// Stop the loops. A poll already in flight is left to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_domain_loop(
    domain: Domain,
    interval: Duration,
    policy: BackoffPolicy,
    pipeline: Arc<Pipeline>,
    stats: Arc<DomainStats>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut job = DomainJob::new(policy);
    let (done_tx, mut done_rx) = mpsc::channel::<Result<CycleReport, PollError>>(1);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let backoff_deadline = job.backoff_deadline();

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                match job.on_tick(Instant::now()) {
                    TickDecision::Run => spawn_poll(domain, &pipeline, &stats, &done_tx),
                    TickDecision::SkipOverlap => {
                        stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Skipping {} poll: previous poll still running", domain);
                    }
                    TickDecision::SkipBackoff => {
                        tracing::debug!("Skipping {} poll: backing off", domain);
                    }
                }
            }
            Some(result) = done_rx.recv() => {
                finish_poll(domain, &mut job, &pipeline, &stats, result);
            }
            _ = tokio::time::sleep_until(backoff_deadline.unwrap_or_else(Instant::now)), if backoff_deadline.is_some() => {
                if job.on_tick(Instant::now()) == TickDecision::Run {
                    tracing::info!("Backoff over, polling {} again", domain);
                    spawn_poll(domain, &pipeline, &stats, &done_tx);
                    ticker.reset();
                }
            }
        }
    }
}

fn spawn_poll(
    domain: Domain,
    pipeline: &Arc<Pipeline>,
    stats: &DomainStats,
    done_tx: &mpsc::Sender<Result<CycleReport, PollError>>,
) {
    stats.polls_started.fetch_add(1, Ordering::Relaxed);

    let pipeline = pipeline.clone();
    let done_tx = done_tx.clone();
    tokio::spawn(async move {
        let result = poll_guarded(async move { pipeline.poll(domain).await }).await;
        if done_tx.send(result).await.is_err() {
            tracing::debug!("{} loop stopped before poll finished", domain);
        }
    });
}

/// Run a poll on its own task so that a panic comes back as a failed poll
/// instead of leaving the job in `Running`.
async fn poll_guarded<F>(poll: F) -> Result<CycleReport, PollError>
where
    F: Future<Output = Result<CycleReport, PollError>> + Send + 'static,
{
    match tokio::spawn(poll).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Poll task failed: {}", e);
            Err(PollError::Panicked(e.to_string()))
        }
    }
}

fn finish_poll(
    domain: Domain,
    job: &mut DomainJob,
    pipeline: &Pipeline,
    stats: &DomainStats,
    result: Result<CycleReport, PollError>,
) {
    match result {
        Ok(report) => {
            stats.polls_succeeded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "{} poll done: {} applied, {} failed, {} events, {} alerts",
                domain,
                report.applied,
                report.failed,
                report.events,
                report.alerts
            );

            let recovered = job.on_success();
            if recovered > 0 {
                tracing::info!("{} polling recovered after {} failures", domain, recovered);
                if let Err(e) = pipeline.engine().record_poll_recovery(domain.as_str(), recovered, Utc::now()) {
                    tracing::error!("Failed to record {} recovery: {}", domain, e);
                }
            }
        }
        Err(e) => {
            stats.polls_failed.fetch_add(1, Ordering::Relaxed);
            let delay = job.on_failure(Instant::now());
            tracing::warn!("{} poll failed: {}; backing off for {:?}", domain, e, delay);

            if job.consecutive_failures() == 1 {
                let error = e.to_string();
                if let Err(e) = pipeline.engine().record_poll_failure(domain.as_str(), 1, &error, Utc::now()) {
                    tracing::error!("Failed to record {} failure: {}", domain, e);
                }
            }
        }
    }
}
