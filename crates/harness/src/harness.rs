//! Run orchestration: deadlines, stop signalling and teardown.
//!
//! Two teardown paths, one per execution model:
//! - [`join_workers`] for OS threads. Waits for the measurement window,
//!   raises the stop flag, then waits at most the join timeout for every
//!   thread to report its exit. Threads that do not report are named in a
//!   [`FeedError::TeardownTimeout`]; nothing is read from their sinks.
//! - [`supervise`] for tasks. Waits for the window, cancels every unit so
//!   each sends a close frame, allows the close grace period, force-aborts
//!   what remains and then awaits every unit.
//!
//! Sinks are only drained after every unit writing them has stopped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use wslat_core::config::AppConfig;
use wslat_core::error::FeedError;
use wslat_core::types::{ConnectionId, StrategyKind, SystemClock};

use crate::observer::Observer;
use crate::result::RunResult;
use crate::strategy::{Strategy, StrategyContext, StrategySettings};

/// A spawned connection thread.
pub(crate) struct Worker {
    pub id: ConnectionId,
    pub handle: JoinHandle<()>,
}

/// Wait out `window`, raise `stop`, and join every worker within
/// `join_timeout`.
///
/// Returns early from the window if every thread has already exited.
pub(crate) fn join_workers(
    workers: Vec<Worker>,
    exits: &Receiver<ConnectionId>,
    window: Duration,
    join_timeout: Duration,
    stop: &AtomicBool,
) -> Result<(), FeedError> {
    let mut exited = HashSet::with_capacity(workers.len());

    collect_exits(exits, Instant::now() + window, workers.len(), &mut exited);
    stop.store(true, Ordering::SeqCst);
    tracing::debug!(exited = exited.len(), "stop signal raised");
    collect_exits(exits, Instant::now() + join_timeout, workers.len(), &mut exited);

    let pending: Vec<ConnectionId> = workers
        .iter()
        .map(|w| w.id)
        .filter(|id| !exited.contains(id))
        .collect();
    if !pending.is_empty() {
        tracing::error!(pending = ?pending, timeout_ms = join_timeout.as_millis() as u64, "threads did not stop");
        return Err(FeedError::TeardownTimeout { pending });
    }

    for worker in workers {
        if worker.handle.join().is_err() {
            tracing::error!(connection = %worker.id, "connection thread panicked");
        }
    }
    Ok(())
}

/// Stop and join `workers` right away, after a failed spawn. Returns the
/// connections whose threads did not stop within `join_timeout`. They are
/// logged, not raised.
pub(crate) fn stop_workers(
    workers: Vec<Worker>,
    exits: &Receiver<ConnectionId>,
    join_timeout: Duration,
    stop: &AtomicBool,
) -> Vec<ConnectionId> {
    match join_workers(workers, exits, Duration::ZERO, join_timeout, stop) {
        Ok(()) => Vec::new(),
        Err(FeedError::TeardownTimeout { pending }) => {
            tracing::error!(pending = ?pending, "threads still running after failed spawn");
            pending
        }
        Err(e) => {
            tracing::error!(error = %e, "stopping threads after failed spawn");
            Vec::new()
        }
    }
}

fn collect_exits(
    exits: &Receiver<ConnectionId>,
    until: Instant,
    expected: usize,
    exited: &mut HashSet<ConnectionId>,
) {
    while exited.len() < expected {
        match exits.recv_deadline(until) {
            Ok(id) => {
                exited.insert(id);
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// How a group of tasks came to an end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// The measurement window elapsed while units were still running.
    pub deadline_reached: bool,
    /// Units that had to be force-cancelled after the close grace period.
    pub aborted: usize,
}

/// Drive `tasks` until the window elapses or all of them finish, then
/// cancel, allow `close_grace`, abort stragglers and await every task.
///
/// Returns only once no task of the set is alive.
pub(crate) async fn supervise(
    tasks: &mut JoinSet<()>,
    cancel: &CancellationToken,
    window: Duration,
    close_grace: Duration,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(res) => log_join(res),
                None => return report,
            },
            _ = &mut deadline => break,
        }
    }

    report.deadline_reached = true;
    tracing::debug!(running = tasks.len(), "deadline reached, closing connections");
    cancel.cancel();

    let grace = tokio::time::sleep(close_grace);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(res) => log_join(res),
                None => return report,
            },
            _ = &mut grace => break,
        }
    }

    report.aborted = tasks.len();
    tracing::warn!(aborted = report.aborted, "close grace elapsed, force-cancelling connections");
    tasks.abort_all();
    while let Some(res) = tasks.join_next().await {
        log_join(res);
    }
    report
}

fn log_join(res: Result<(), JoinError>) {
    match res {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => tracing::debug!("connection task force-cancelled"),
        Err(e) => tracing::error!(error = %e, "connection task panicked"),
    }
}

/// Runs one strategy for one measurement window.
pub struct Harness {
    strategy: Strategy,
    duration: Duration,
    observer: Arc<dyn Observer>,
}

impl Harness {
    pub fn new(strategy: Strategy, duration: Duration, observer: Arc<dyn Observer>) -> Result<Self, FeedError> {
        if duration.is_zero() {
            return Err(FeedError::InvalidState(
                "measurement window must be positive".to_string(),
            ));
        }
        Ok(Self {
            strategy,
            duration,
            observer,
        })
    }

    /// Build the configured strategy against the system clock.
    pub fn from_config(cfg: &AppConfig, observer: Arc<dyn Observer>) -> Result<Self, FeedError> {
        let ctx = Arc::new(StrategyContext::new(
            StrategySettings::from_config(cfg),
            observer.clone(),
            Arc::new(SystemClock),
        ));
        let strategy = Strategy::new(
            cfg.run.strategy,
            ctx,
            &cfg.feed.stream_name(),
            cfg.run.connections,
        )?;
        Self::new(strategy, cfg.run.duration(), observer)
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Record, tear down, and return one series per logical connection.
    pub fn run(&self) -> Result<RunResult, FeedError> {
        let started = Instant::now();
        let result = self.strategy.run(self.duration)?;

        if result.len() != self.strategy.connections() {
            return Err(FeedError::InvalidState(format!(
                "expected {} series, strategy returned {}",
                self.strategy.connections(),
                result.len()
            )));
        }

        tracing::info!(
            strategy = %result.kind,
            connections = result.len(),
            samples = result.total_samples(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run complete"
        );
        self.observer.on_run_complete(&result);
        Ok(result)
    }
}
