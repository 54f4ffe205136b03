//! Dispatcher - the poll loop and its dispatch strategies
//!
//! A [`Dispatcher`] performs one poll cycle at a time; [`DispatchLoop`] drives it on a
//! dedicated OS thread until the shutdown token is cancelled, sleeping between cycles
//! when the dispatcher reports it is idle or needs to back off.

mod ordered;
mod state;
mod unordered;

pub use ordered::OrderedDispatcher;
pub use state::DispatchState;
pub use unordered::{UnorderedDispatcher, UnorderedState};

use std::str::FromStr;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::CommitMode;
use crate::metrics_consts::{IDLE_SLEEPS, POLL_CYCLES};
use crate::types::Partition;

const POLL_COUNT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Result of one poll cycle, telling the loop what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Work was polled, started or is still running
    Busy,
    /// Nothing polled, nothing running, nothing left to commit
    Idle,
    /// The poll failed
    Backoff,
}

pub trait Dispatcher: Send {
    fn poll_cycle(&mut self) -> CycleOutcome;

    /// Drain and give up `partitions`, committing what was processed.
    fn revoke(&mut self, partitions: &[Partition]);

    fn pause_all(&self);

    fn resume_all(&self);

    /// Commit, leave the group and wait for the worker pool. Called once, after the
    /// last cycle.
    fn shutdown(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Ordered,
    Unordered,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ordered" => Ok(DispatchMode::Ordered),
            "unordered" => Ok(DispatchMode::Unordered),
            _ => Err(format!("Invalid dispatch mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_timeout: Duration,
    pub poll_error_backoff: Duration,
    /// Sleep after a cycle with nothing to do; zero disables it
    pub idle_interval: Duration,
    pub commit_interval: Duration,
    /// Mode of non-forced commits
    pub commit_mode: CommitMode,
    pub monitor_interval: Duration,
    pub shutdown_timeout: Duration,
    pub revoke_drain_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(250),
            poll_error_backoff: Duration::from_secs(1),
            idle_interval: Duration::ZERO,
            commit_interval: Duration::from_millis(3000),
            commit_mode: CommitMode::Async,
            monitor_interval: Duration::from_millis(5000),
            shutdown_timeout: Duration::from_millis(10000),
            revoke_drain_timeout: Duration::from_millis(30000),
        }
    }
}

pub struct DispatchLoop {
    dispatcher: Box<dyn Dispatcher>,
    runtime: Handle,
    shutdown: CancellationToken,
    idle_interval: Duration,
    poll_error_backoff: Duration,
}

impl DispatchLoop {
    pub fn new(
        dispatcher: Box<dyn Dispatcher>,
        runtime: Handle,
        shutdown: CancellationToken,
        settings: &DispatcherSettings,
    ) -> Self {
        Self {
            dispatcher,
            runtime,
            shutdown,
            idle_interval: settings.idle_interval,
            poll_error_backoff: settings.poll_error_backoff,
        }
    }

    /// Run the loop on a new thread named `partition-dispatcher`.
    pub fn spawn(self) -> std::io::Result<DispatcherHandle> {
        let shutdown = self.shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("partition-dispatcher".to_string())
            .spawn(move || self.run())?;

        Ok(DispatcherHandle { thread, shutdown })
    }

    /// Run cycles until shutdown, then shut the dispatcher down. Blocks the calling
    /// thread, which must not be a runtime worker thread.
    pub fn run(mut self) {
        info!("Dispatch loop started");
        let mut polls: u64 = 0;
        let mut last_count_log = Instant::now();

        while !self.shutdown.is_cancelled() {
            let outcome = self.dispatcher.poll_cycle();
            polls += 1;
            metrics::counter!(POLL_CYCLES).increment(1);

            if last_count_log.elapsed() >= POLL_COUNT_LOG_INTERVAL {
                debug!(polls = polls, "Dispatcher poll count");
                last_count_log = Instant::now();
            }

            match outcome {
                CycleOutcome::Busy => {}
                CycleOutcome::Idle => {
                    if !self.idle_interval.is_zero() {
                        metrics::counter!(IDLE_SLEEPS).increment(1);
                        self.sleep(self.idle_interval);
                    }
                }
                CycleOutcome::Backoff => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    self.sleep(self.poll_error_backoff);
                }
            }
        }

        info!(polls = polls, "Dispatch loop stopping");
        self.dispatcher.shutdown();
        info!("Dispatch loop stopped");
    }

    /// Sleep for `duration` unless shutdown is requested first.
    fn sleep(&self, duration: Duration) {
        let shutdown = self.shutdown.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }
}

pub struct DispatcherHandle {
    thread: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl DispatcherHandle {
    /// Ask the loop to stop after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the loop thread to exit. Returns `false` if it panicked.
    pub fn join(self) -> bool {
        self.thread.join().is_ok()
    }
}
