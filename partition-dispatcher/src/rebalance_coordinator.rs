//! Rebalance Coordinator - drains in-flight work before partitions change owner
//!
//! The broker client invokes the coordinator synchronously from its rebalance callback,
//! before the group applies the new assignment. For revoked partitions the coordinator
//! stops every active batch processor, waits (bounded) for each of them, and commits what
//! was actually processed while this consumer still owns the partitions.
//!
//! ```text
//! broker poll ─▶ rebalance callback ─▶ on_partitions_revoked
//!                                        ├─ lock dispatch state
//!                                        ├─ drain_revoked: stop all, wait each, stage offsets
//!                                        └─ commit staged offsets (sync)
//! ```
//!
//! The dispatch state is shared with the dispatcher loop through one mutex. Rebalance
//! callbacks run inside `poll` on the dispatcher thread, and the loop never holds the
//! lock across `poll`, so the lock is not contended.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::broker::{CommitMode, OffsetCommitter, RebalanceListener};
use crate::metrics_consts::{
    OFFSET_COMMITS, PARTITIONS_ASSIGNED, PARTITIONS_REVOKED, REVOKE_DRAINS,
};
use crate::types::Partition;

/// Dispatcher state that can give up partitions.
pub trait RevocationDrain: Send {
    /// Stop and drain the work of `partitions`, forget them, and return the offsets that
    /// are safe to commit for them.
    fn drain_revoked(
        &mut self,
        partitions: &[Partition],
        drain_timeout: Duration,
    ) -> HashMap<Partition, i64>;
}

pub struct RebalanceCoordinator<S> {
    state: Arc<Mutex<S>>,
    drain_timeout: Duration,
}

impl<S: RevocationDrain> RebalanceCoordinator<S> {
    pub fn new(state: Arc<Mutex<S>>, drain_timeout: Duration) -> Self {
        Self {
            state,
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Drain `partitions` and commit their offsets through `committer`.
    pub fn revoke(&self, partitions: &[Partition], committer: &dyn OffsetCommitter) {
        if partitions.is_empty() {
            return;
        }

        info!(
            count = partitions.len(),
            partitions = ?partitions,
            "Partitions revoked, draining in-flight work"
        );
        metrics::counter!(PARTITIONS_REVOKED).increment(partitions.len() as u64);

        let started = Instant::now();
        let offsets = {
            let mut state = self.state.lock();
            state.drain_revoked(partitions, self.drain_timeout)
        };

        commit_revoked(&offsets, committer);

        info!(
            count = partitions.len(),
            committed = offsets.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Revoke drain complete"
        );
    }
}

impl<S: RevocationDrain> RebalanceListener for RebalanceCoordinator<S> {
    fn on_partitions_revoked(&self, partitions: &[Partition], committer: &dyn OffsetCommitter) {
        self.revoke(partitions, committer);
    }

    fn on_partitions_assigned(&self, partitions: &[Partition]) {
        info!(
            count = partitions.len(),
            partitions = ?partitions,
            "Partitions assigned"
        );
        metrics::counter!(PARTITIONS_ASSIGNED).increment(partitions.len() as u64);
    }
}

fn commit_revoked(offsets: &HashMap<Partition, i64>, committer: &dyn OffsetCommitter) {
    if offsets.is_empty() {
        return;
    }

    match committer.commit(offsets, CommitMode::Sync) {
        Ok(()) => {
            metrics::counter!(OFFSET_COMMITS, "mode" => "sync", "result" => "ok").increment(1);
        }
        Err(e) => {
            // the next owner starts from the last committed offset and reprocesses
            error!(
                error = ?e,
                partitions = offsets.len(),
                "Failed to commit offsets of revoked partitions"
            );
            metrics::counter!(OFFSET_COMMITS, "mode" => "sync", "result" => "failed").increment(1);
        }
    }
}

/// How the drain of one revoked partition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Drained,
    NotStarted,
    TimedOut,
}

impl DrainResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainResult::Drained => "drained",
            DrainResult::NotStarted => "not_started",
            DrainResult::TimedOut => "timed_out",
        }
    }
}

pub(crate) fn record_drain(partition: &Partition, result: DrainResult, drain_timeout: Duration) {
    if result == DrainResult::TimedOut {
        error!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            timeout_ms = drain_timeout.as_millis() as u64,
            "Timed out draining revoked partition, committing nothing for it"
        );
    } else if result == DrainResult::NotStarted {
        warn!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Revoked partition had not started processing"
        );
    }
    metrics::counter!(REVOKE_DRAINS, "result" => result.as_str()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockBroker;

    struct FixedDrain {
        offsets: HashMap<Partition, i64>,
        drained: Vec<Partition>,
    }

    impl RevocationDrain for FixedDrain {
        fn drain_revoked(
            &mut self,
            partitions: &[Partition],
            _drain_timeout: Duration,
        ) -> HashMap<Partition, i64> {
            self.drained.extend_from_slice(partitions);
            partitions
                .iter()
                .filter_map(|p| self.offsets.get_key_value(p))
                .map(|(p, o)| (p.clone(), *o))
                .collect()
        }
    }

    fn p(num: i32) -> Partition {
        Partition::new("topic".to_string(), num)
    }

    #[test]
    fn test_revoke_commits_drained_offsets_synchronously() {
        let state = Arc::new(Mutex::new(FixedDrain {
            offsets: HashMap::from([(p(0), 10), (p(1), 20)]),
            drained: Vec::new(),
        }));
        let coordinator = RebalanceCoordinator::new(state.clone(), Duration::from_secs(1));
        let broker = MockBroker::new();

        coordinator.on_partitions_revoked(&[p(0)], &broker);

        let commits = broker.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, HashMap::from([(p(0), 10)]));
        assert_eq!(commits[0].1, CommitMode::Sync);
        assert_eq!(state.lock().drained, vec![p(0)]);
    }

    #[test]
    fn test_revoke_without_offsets_does_not_commit() {
        let state = Arc::new(Mutex::new(FixedDrain {
            offsets: HashMap::new(),
            drained: Vec::new(),
        }));
        let coordinator = RebalanceCoordinator::new(state.clone(), Duration::from_secs(1));
        let broker = MockBroker::new();

        coordinator.on_partitions_revoked(&[p(3)], &broker);
        coordinator.on_partitions_revoked(&[], &broker);

        assert!(broker.commits().is_empty());
        assert_eq!(state.lock().drained, vec![p(3)]);
    }

    #[test]
    fn test_failed_revoke_commit_is_not_retried() {
        let state = Arc::new(Mutex::new(FixedDrain {
            offsets: HashMap::from([(p(0), 10)]),
            drained: Vec::new(),
        }));
        let coordinator = RebalanceCoordinator::new(state, Duration::from_secs(1));
        let broker = MockBroker::new();
        broker.fail_commits(true);

        coordinator.on_partitions_revoked(&[p(0)], &broker);

        assert!(broker.commits().is_empty());
        assert_eq!(broker.commit_attempts(), 1);
    }
}
