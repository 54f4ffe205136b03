//! Commit Scheduler - decides when ledger entries are flushed to the broker
//!
//! Non-forced flushes happen at most once per commit interval, using the configured
//! [`CommitMode`]. Forced flushes (shutdown) ignore the interval and always commit
//! synchronously. Entries from a failed commit go back into the ledger so the next
//! attempt covers them.

use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::broker::{CommitMode, OffsetCommitter};
use crate::metrics_consts::OFFSET_COMMITS;
use crate::offset_ledger::OffsetLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing to commit, or the interval has not elapsed yet
    Skipped,
    /// Offsets for this many partitions were committed
    Committed(usize),
    Failed,
}

pub struct CommitScheduler {
    interval: Duration,
    mode: CommitMode,
    last_commit: Instant,
}

impl CommitScheduler {
    pub fn new(interval: Duration, mode: CommitMode) -> Self {
        Self {
            interval,
            mode,
            last_commit: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    pub fn maybe_commit(
        &mut self,
        ledger: &mut OffsetLedger,
        committer: &dyn OffsetCommitter,
        force: bool,
    ) -> CommitOutcome {
        self.maybe_commit_at(Instant::now(), ledger, committer, force)
    }

    pub fn maybe_commit_at(
        &mut self,
        now: Instant,
        ledger: &mut OffsetLedger,
        committer: &dyn OffsetCommitter,
        force: bool,
    ) -> CommitOutcome {
        if ledger.is_empty() {
            return CommitOutcome::Skipped;
        }
        if !force && now.saturating_duration_since(self.last_commit) <= self.interval {
            return CommitOutcome::Skipped;
        }

        let mode = if force { CommitMode::Sync } else { self.mode };
        let offsets = ledger.drain_all();
        self.last_commit = now;

        match committer.commit(&offsets, mode) {
            Ok(()) => {
                debug!(
                    partitions = offsets.len(),
                    mode = mode.as_str(),
                    forced = force,
                    "Committed offsets"
                );
                metrics::counter!(OFFSET_COMMITS, "mode" => mode.as_str(), "result" => "ok")
                    .increment(1);
                CommitOutcome::Committed(offsets.len())
            }
            Err(e) => {
                if force {
                    error!(error = ?e, partitions = offsets.len(), "Forced offset commit failed");
                } else {
                    warn!(
                        error = ?e,
                        partitions = offsets.len(),
                        "Offset commit failed, will retry"
                    );
                }
                metrics::counter!(OFFSET_COMMITS, "mode" => mode.as_str(), "result" => "failed")
                    .increment(1);
                ledger.restore(offsets);
                CommitOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockBroker;
    use crate::types::Partition;

    fn p(num: i32) -> Partition {
        Partition::new("topic".to_string(), num)
    }

    #[test]
    fn test_empty_ledger_never_reaches_broker() {
        let broker = MockBroker::new();
        let mut ledger = OffsetLedger::new();
        let mut scheduler = CommitScheduler::new(Duration::from_millis(100), CommitMode::Async);

        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(
            scheduler.maybe_commit_at(later, &mut ledger, &broker, true),
            CommitOutcome::Skipped
        );
        assert!(broker.commits().is_empty());
    }

    #[test]
    fn test_commit_cadence() {
        let broker = MockBroker::new();
        let mut ledger = OffsetLedger::new();
        let mut scheduler = CommitScheduler::new(Duration::from_millis(100), CommitMode::Async);
        let start = Instant::now();

        ledger.record(&p(0), 10);
        ledger.record(&p(1), 20);

        for ms in [0, 30, 60, 99] {
            let outcome = scheduler.maybe_commit_at(
                start + Duration::from_millis(ms),
                &mut ledger,
                &broker,
                false,
            );
            assert_eq!(outcome, CommitOutcome::Skipped);
        }
        assert!(broker.commits().is_empty());

        let outcome = scheduler.maybe_commit_at(
            start + Duration::from_millis(150),
            &mut ledger,
            &broker,
            false,
        );
        assert_eq!(outcome, CommitOutcome::Committed(2));

        let commits = broker.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].1, CommitMode::Async);
        assert_eq!(commits[0].0.get(&p(0)), Some(&10));
        assert_eq!(commits[0].0.get(&p(1)), Some(&20));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_forced_commit_is_sync_and_ignores_interval() {
        let broker = MockBroker::new();
        let mut ledger = OffsetLedger::new();
        let mut scheduler = CommitScheduler::new(Duration::from_secs(60), CommitMode::Async);

        ledger.record(&p(0), 5);
        let outcome = scheduler.maybe_commit(&mut ledger, &broker, true);

        assert_eq!(outcome, CommitOutcome::Committed(1));
        assert_eq!(broker.commits()[0].1, CommitMode::Sync);
    }

    #[test]
    fn test_failed_commit_restores_ledger() {
        let broker = MockBroker::new();
        broker.fail_commits(true);
        let mut ledger = OffsetLedger::new();
        let mut scheduler = CommitScheduler::new(Duration::from_millis(10), CommitMode::Sync);
        let start = Instant::now();

        ledger.record(&p(0), 42);
        let outcome = scheduler.maybe_commit_at(
            start + Duration::from_millis(20),
            &mut ledger,
            &broker,
            false,
        );

        assert_eq!(outcome, CommitOutcome::Failed);
        assert_eq!(ledger.get(&p(0)), Some(42));

        broker.fail_commits(false);
        let outcome = scheduler.maybe_commit_at(
            start + Duration::from_millis(40),
            &mut ledger,
            &broker,
            false,
        );
        assert_eq!(outcome, CommitOutcome::Committed(1));
        assert_eq!(broker.commits().len(), 1);
    }
}
