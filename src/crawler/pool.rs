//! Worker pool
//!
//! Spawns the workers on a `JoinSet` next to a monitor task that decides when the run is
//! over. Stopping is cooperative: the flag is raised and each worker exits at the top of
//! its next iteration.

use crate::crawler::worker::{Worker, WorkerContext, WorkerStats, PAGES_FETCHED_COUNTER};
use crate::{DriftnetError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Consecutive idle observations before an idle pool is stopped
const IDLE_POLLS_TO_STOP: u32 = 3;

#[derive(Debug, Default)]
struct Control {
    stopped: AtomicBool,
    active: AtomicUsize,
}

/// Cooperative stop flag shared by the pool, its workers and the caller
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.control.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.control.stopped.load(Ordering::SeqCst)
    }

    /// Workers currently inside an iteration
    pub fn active(&self) -> usize {
        self.control.active.load(Ordering::SeqCst)
    }

    /// Marks the calling worker busy until the guard drops
    pub(crate) fn enter(&self) -> ActiveGuard {
        self.control.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            control: self.control.clone(),
        }
    }
}

pub(crate) struct ActiveGuard {
    control: Arc<Control>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.control.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Why the pool stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The frontier stayed empty with every worker idle
    Idle,
    /// The run reached its successful-fetch limit
    MaxPages,
    /// The stop handle was triggered from outside
    Requested,
    /// A worker or the monitor hit a store failure
    Failed,
}

/// Summary of one pool run
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub workers: Vec<WorkerStats>,
    pub stop_reason: StopReason,
    /// Successful fetches by any process since the run started
    pub pages_fetched: u64,
    pub elapsed: Duration,
}

impl PoolReport {
    /// Sums the per-worker counts
    pub fn totals(&self) -> WorkerStats {
        self.workers
            .iter()
            .fold(WorkerStats::default(), |mut total, stats| {
                total.claimed += stats.claimed;
                total.fetched += stats.fetched;
                total.deferred += stats.deferred;
                total.retried += stats.retried;
                total.redirected += stats.redirected;
                total.terminal += stats.terminal;
                total
            })
    }
}

/// Runs `concurrency` workers over one shared context
pub struct WorkerPool {
    ctx: WorkerContext,
    concurrency: usize,
    max_pages: Option<u64>,
    stop_when_idle: bool,
    stop: StopHandle,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, concurrency: usize) -> Self {
        Self {
            ctx,
            concurrency: concurrency.max(1),
            max_pages: None,
            stop_when_idle: true,
            stop: StopHandle::new(),
        }
    }

    /// Stops after this many successful fetches in this run
    pub fn with_max_pages(mut self, max_pages: Option<u64>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_stop_when_idle(mut self, stop_when_idle: bool) -> Self {
        self.stop_when_idle = stop_when_idle;
        self
    }

    /// Handle that stops the pool when triggered
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs the workers until a stop condition holds
    ///
    /// Returns the first worker error once every worker has exited.
    pub async fn run(self) -> Result<PoolReport> {
        let started = Instant::now();
        let store = self.ctx.frontier.store().clone();
        let baseline = store.counter(PAGES_FETCHED_COUNTER).await?;

        info!(
            workers = self.concurrency,
            max_pages = ?self.max_pages,
            stop_when_idle = self.stop_when_idle,
            any_domain = self.ctx.settings.allowed_domains.is_unrestricted(),
            "Starting worker pool"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            let worker = Worker::new(id, self.ctx.clone());
            workers.spawn(worker.run(self.stop.clone()));
        }

        let monitor = tokio::spawn(monitor(
            self.ctx.clone(),
            self.stop.clone(),
            baseline,
            self.max_pages,
            self.stop_when_idle,
        ));

        let mut report_workers = Vec::with_capacity(self.concurrency);
        let mut first_error: Option<DriftnetError> = None;

        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(stats)) => {
                    report_workers.push(stats);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => DriftnetError::Worker(e.to_string()),
            };

            error!(error = %failure, "Worker failed, stopping pool");
            self.stop.stop();
            first_error.get_or_insert(failure);
        }

        // Workers can also exit because a fatal error stopped them all
        self.stop.stop();
        let monitored = monitor
            .await
            .map_err(|e| DriftnetError::Worker(e.to_string()))?;

        if let Some(e) = first_error {
            return Err(e);
        }
        let stop_reason = monitored?;

        let fetched = store.counter(PAGES_FETCHED_COUNTER).await? - baseline;
        report_workers.sort_by_key(|stats| stats.worker_id);

        let report = PoolReport {
            workers: report_workers,
            stop_reason,
            pages_fetched: u64::try_from(fetched).unwrap_or(0),
            elapsed: started.elapsed(),
        };

        let totals = report.totals();
        info!(
            reason = ?report.stop_reason,
            pages_fetched = report.pages_fetched,
            claimed = totals.claimed,
            deferred = totals.deferred,
            retried = totals.retried,
            redirected = totals.redirected,
            terminal = totals.terminal,
            elapsed = ?report.elapsed,
            "Worker pool finished"
        );

        Ok(report)
    }
}

/// Raises the stop flag when a stop condition holds; returns why the pool stopped
async fn monitor(
    ctx: WorkerContext,
    stop: StopHandle,
    baseline: i64,
    max_pages: Option<u64>,
    stop_when_idle: bool,
) -> Result<StopReason> {
    let poll = ctx.settings.idle_poll;
    let store = ctx.frontier.store().clone();
    let mut idle_polls = 0;
    let mut last_logged = 0;

    loop {
        if stop.is_stopped() {
            return Ok(StopReason::Requested);
        }

        let outcome: Result<Option<StopReason>> = async {
            let fetched = store.counter(PAGES_FETCHED_COUNTER).await? - baseline;
            let fetched = u64::try_from(fetched).unwrap_or(0);

            if fetched >= last_logged + 100 {
                last_logged = fetched;
                let frontier = ctx.frontier.len().await?;
                info!(fetched, frontier, "Progress");
            }

            if max_pages.is_some_and(|max| fetched >= max) {
                info!(fetched, "Page limit reached");
                return Ok(Some(StopReason::MaxPages));
            }

            if stop_when_idle {
                if stop.active() == 0 && ctx.frontier.is_empty().await? {
                    idle_polls += 1;
                    debug!(idle_polls, "Pool idle");
                } else {
                    idle_polls = 0;
                }

                if idle_polls >= IDLE_POLLS_TO_STOP {
                    info!("Frontier drained");
                    return Ok(Some(StopReason::Idle));
                }
            }

            Ok(None)
        }
        .await;

        match outcome {
            Ok(Some(reason)) => {
                stop.stop();
                return Ok(reason);
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Monitor failed, stopping pool");
                stop.stop();
                return Err(e);
            }
        }

        tokio::time::sleep(poll).await;
    }
}
