//! # Cleanup Scheduler
//!
//! Runs a sweep of expired records on a fixed interval and guarantees that
//! at most one sweep is in flight.
//!
//! ## State Machine
//!
//! ```text
//!              tick (CAS Idle → Running)
//!     ┌──────┐ ─────────────────────────► ┌─────────┐
//!     │ Idle │                            │ Running │ ── tick ──► warn + skip
//!     └──────┘ ◄───────────────────────── └─────────┘
//!               sweep finished (ok / err)
//! ```
//!
//! The timer loop never waits for a sweep: each sweep runs in its own task,
//! so ticks keep firing on schedule and an overrunning sweep is reported as
//! a skipped tick instead of silently stretching the interval. A failed
//! sweep is logged and counted; the next tick may try again.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::store::TokenStore;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

/// Longest accepted sweep interval (365 days).
pub const MAX_CLEAN_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// One sweep over a store.
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    /// Removes expired records and reports the keys left per bucket.
    async fn sweep(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, usize>>;
}

#[async_trait]
impl Sweep for TokenStore {
    async fn sweep(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, usize>> {
        self.clean(None, cancel).await
    }
}

/// Whether a sweep is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// No sweep running; the next tick starts one.
    Idle,
    /// A sweep is running; ticks are skipped.
    Running,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Periodic, non-overlapping sweep runner.
///
/// ```rust,no_run
/// use ratekeeper::{BucketConfig, BucketSet, CleanRunner, TokenStore};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run() {
/// let buckets = BucketSet::from_configs(vec![BucketConfig::new("login", 5, 60_000).unwrap()]).unwrap();
/// let store = Arc::new(TokenStore::new(buckets));
///
/// let handle = CleanRunner::new(store, Duration::from_secs(30)).spawn();
/// // ...
/// handle.shutdown().await;
/// # }
/// ```
pub struct CleanRunner<S: Sweep> {
    sweeper: Arc<S>,
    interval: Duration,
    deadline: Option<Duration>,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
    sweeps: TaskTracker,
}

impl<S: Sweep> CleanRunner<S> {
    /// Creates a runner sweeping `sweeper` every `interval`.
    ///
    /// An interval of zero or above [`MAX_CLEAN_INTERVAL`] never sweeps; the
    /// runner logs an error and waits for shutdown.
    pub fn new(sweeper: Arc<S>, interval: Duration) -> Self {
        Self {
            sweeper,
            interval,
            deadline: None,
            state: Arc::new(AtomicU8::new(IDLE)),
            counters: Arc::new(Counters::default()),
            sweeps: TaskTracker::new(),
        }
    }

    /// Aborts any sweep still running after `deadline`, between two chunks.
    pub fn with_sweep_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Starts the timer loop on the current runtime.
    ///
    /// The first sweep happens one interval after this call.
    pub fn spawn(self) -> CleanRunnerHandle {
        let shutdown = CancellationToken::new();
        let stats = CleanRunnerStats {
            state: self.state.clone(),
            counters: self.counters.clone(),
        };
        let sweeps = self.sweeps.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(self.run(token));

        CleanRunnerHandle {
            join,
            shutdown,
            stats,
            sweeps,
        }
    }

    async fn run(self, shutdown: CancellationToken) {
        let start = Some(self.interval)
            .filter(|i| !i.is_zero() && *i <= MAX_CLEAN_INTERVAL)
            .and_then(|i| Instant::now().checked_add(i));
        let Some(start) = start else {
            error!(
                interval = ?self.interval,
                max = ?MAX_CLEAN_INTERVAL,
                "clean interval out of range, sweeper disabled"
            );
            shutdown.cancelled().await;
            return;
        };
        info!(interval_ms = self.interval.as_millis() as u64, "started clean runner");

        let mut ticker = interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("clean runner stopping");
                    break;
                }
                _ = ticker.tick() => self.on_tick(&shutdown),
            }
        }
    }

    fn on_tick(&self, shutdown: &CancellationToken) {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Cleaning failed to run due to previous incomplete process, \
                 you should consider increasing clean-interval setting"
            );
            return;
        }

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        let sweeper = self.sweeper.clone();
        let state = self.state.clone();
        let counters = self.counters.clone();
        let deadline = self.deadline;
        let cancel = shutdown.child_token();

        self.sweeps.spawn(async move {
            let _guard = StateGuard { state: &state };
            let started = Instant::now();

            let outcome = match deadline {
                Some(limit) => tokio::time::timeout(limit, sweeper.sweep(&cancel))
                    .await
                    .unwrap_or_else(|_| Err(Error::SweepDeadline(limit))),
                None => sweeper.sweep(&cancel).await,
            };

            match outcome {
                Ok(remaining) => debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ?remaining,
                    "sweep finished"
                ),
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "sweep failed");
                }
            }
        });
    }
}

impl<S: Sweep> std::fmt::Debug for CleanRunner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanRunner")
            .field("interval", &self.interval)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Resets the state to idle when a sweep task ends, even by panic.
struct StateGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

/// Read-only view of a running scheduler.
#[derive(Debug, Clone)]
pub struct CleanRunnerStats {
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
}

impl CleanRunnerStats {
    /// Current sweep state.
    pub fn state(&self) -> SweepState {
        match self.state.load(Ordering::Acquire) {
            IDLE => SweepState::Idle,
            _ => SweepState::Running,
        }
    }

    /// Sweeps started so far.
    pub fn started(&self) -> u64 {
        self.counters.started.load(Ordering::Relaxed)
    }

    /// Ticks skipped because a sweep was still running.
    pub fn skipped(&self) -> u64 {
        self.counters.skipped.load(Ordering::Relaxed)
    }

    /// Sweeps that ended in an error.
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

/// Handle to a spawned [`CleanRunner`].
#[derive(Debug)]
pub struct CleanRunnerHandle {
    join: JoinHandle<()>,
    shutdown: CancellationToken,
    stats: CleanRunnerStats,
    sweeps: TaskTracker,
}

impl CleanRunnerHandle {
    /// Counters and state of the runner.
    pub fn stats(&self) -> &CleanRunnerStats {
        &self.stats
    }

    /// Whether the timer task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stops the timer, cancels any in-flight sweep and waits for it to end.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "clean runner task ended abnormally");
        }
        self.sweeps.close();
        self.sweeps.wait().await;
    }
}
