//! Unordered dispatch.
//!
//! Every polled record runs as its own single-record processor, so records of one
//! partition may execute concurrently and out of order. Ingestion is throttled by not
//! polling again until all work from the previous poll is done; no partition is paused
//! except by the operator override.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{CycleOutcome, Dispatcher, DispatcherSettings};
use crate::batch_processor::{BatchProcessor, ProcessorState};
use crate::broker::{BrokerClient, RebalanceListener};
use crate::commit_scheduler::CommitScheduler;
use crate::metrics_consts::{ACTIVE_PROCESSORS, BATCHES_STARTED, POLL_ERRORS, RECORDS_POLLED};
use crate::offset_ledger::OffsetLedger;
use crate::partition_gate::{OperationalControls, PartitionGate};
use crate::partition_monitor::PartitionMonitor;
use crate::rebalance_coordinator::{
    record_drain, DrainResult, RebalanceCoordinator, RevocationDrain,
};
use crate::request::RequestHandler;
use crate::types::{Partition, RecordBatch};
use crate::worker_pool::WorkerPool;

#[derive(Default)]
pub struct UnorderedState {
    /// Processors started by the last poll, per partition
    pub in_flight: HashMap<Partition, Vec<Arc<BatchProcessor>>>,
    pub ledger: OffsetLedger,
    pub monitor: PartitionMonitor,
}

impl UnorderedState {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> Vec<Arc<BatchProcessor>> {
        self.in_flight
            .values()
            .flatten()
            .filter(|p| !p.is_done())
            .cloned()
            .collect()
    }

    /// Record each partition's highest processed offset and forget the processors.
    /// Only called once every in-flight processor is done.
    fn settle(&mut self) {
        for (partition, processors) in self.in_flight.drain() {
            if let Some(offset) = processors
                .iter()
                .filter_map(|p| p.committable_offset())
                .max()
            {
                self.ledger.record(&partition, offset);
            }
        }
    }
}

impl RevocationDrain for UnorderedState {
    fn drain_revoked(
        &mut self,
        partitions: &[Partition],
        drain_timeout: Duration,
    ) -> HashMap<Partition, i64> {
        let mut draining = Vec::new();
        for partition in partitions {
            if let Some(processors) = self.in_flight.remove(partition) {
                for processor in &processors {
                    processor.stop_processing();
                }
                draining.push((partition.clone(), processors));
            }
        }

        // entries in the ledger come from polls whose work all completed
        let mut staged = self.ledger.take(partitions);

        let deadline = Instant::now() + drain_timeout;
        for (partition, processors) in draining {
            let mut all_finished = true;
            for processor in &processors {
                let remaining = deadline.saturating_duration_since(Instant::now());
                processor.wait_for_completion(remaining);
                all_finished &= processor.state() == ProcessorState::Finished;
            }

            if all_finished {
                if let Some(offset) = processors
                    .iter()
                    .filter_map(|p| p.committable_offset())
                    .max()
                {
                    let entry = staged.entry(partition.clone()).or_insert(offset);
                    *entry = (*entry).max(offset);
                }
                record_drain(&partition, DrainResult::Drained, drain_timeout);
            } else {
                let result = if processors.iter().all(|p| p.is_done()) {
                    DrainResult::NotStarted
                } else {
                    DrainResult::TimedOut
                };
                record_drain(&partition, result, drain_timeout);
            }
        }

        for partition in partitions {
            self.monitor.remove(partition);
        }

        staged
    }
}

pub struct UnorderedDispatcher<B> {
    broker: B,
    state: Arc<Mutex<UnorderedState>>,
    coordinator: Arc<RebalanceCoordinator<UnorderedState>>,
    gate: PartitionGate,
    scheduler: CommitScheduler,
    pool: WorkerPool,
    handler: Arc<RequestHandler>,
    settings: DispatcherSettings,
    known_topics: BTreeSet<String>,
    last_monitor_log: Instant,
}

impl<B: BrokerClient> UnorderedDispatcher<B> {
    pub fn new<F, E>(
        settings: DispatcherSettings,
        pool: WorkerPool,
        handler: Arc<RequestHandler>,
        controls: Arc<OperationalControls>,
        connect: F,
    ) -> Result<Self, E>
    where
        F: FnOnce(Arc<dyn RebalanceListener>) -> Result<B, E>,
    {
        let state = Arc::new(Mutex::new(UnorderedState::new()));
        let coordinator = Arc::new(RebalanceCoordinator::new(
            state.clone(),
            settings.revoke_drain_timeout,
        ));
        let listener: Arc<dyn RebalanceListener> = coordinator.clone();
        let broker = connect(listener)?;

        Ok(Self {
            broker,
            state,
            coordinator,
            gate: PartitionGate::new(controls),
            scheduler: CommitScheduler::new(settings.commit_interval, settings.commit_mode),
            pool,
            handler,
            settings,
            known_topics: BTreeSet::new(),
            last_monitor_log: Instant::now(),
        })
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Wait, for at most one poll timeout, for the previous poll's work. Returns `true`
    /// once all of it is done and its offsets are in the ledger.
    fn settle_in_flight(&mut self) -> bool {
        let pending = self.state.lock().pending();
        let deadline = Instant::now() + self.settings.poll_timeout;

        for processor in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            processor.wait_for_completion(remaining);
            if !processor.is_done() {
                return false;
            }
        }

        self.state.lock().settle();
        true
    }

    fn log_monitor(&mut self, state: &UnorderedState) {
        let now = Instant::now();
        if now.duration_since(self.last_monitor_log) < self.settings.monitor_interval {
            return;
        }
        self.last_monitor_log = now;

        let in_flight: usize = state.in_flight.values().map(Vec::len).sum();
        debug!(
            in_flight = in_flight,
            paused = state.monitor.len(),
            "Unordered dispatcher status"
        );
        let topics: Vec<String> = self.known_topics.iter().cloned().collect();
        state.monitor.snapshot(now).publish(&topics);
    }
}

impl<B: BrokerClient> Dispatcher for UnorderedDispatcher<B> {
    fn poll_cycle(&mut self) -> CycleOutcome {
        let shared = self.state.clone();

        {
            let mut state = shared.lock();
            self.gate
                .apply_global_triggers(&mut self.broker, &mut state.monitor);
        }

        if !self.settle_in_flight() {
            let mut state = shared.lock();
            self.log_monitor(&state);
            self.scheduler
                .maybe_commit(&mut state.ledger, &self.broker, false);
            return CycleOutcome::Busy;
        }

        let batches = match self.broker.poll(self.settings.poll_timeout) {
            Ok(batches) => batches,
            Err(e) => {
                warn!(error = ?e, "Poll failed, backing off");
                metrics::counter!(POLL_ERRORS, "error" => e.kind()).increment(1);
                return CycleOutcome::Backoff;
            }
        };

        let polled: usize = batches.iter().map(RecordBatch::len).sum();
        if polled > 0 {
            metrics::counter!(RECORDS_POLLED).increment(polled as u64);
        }

        let mut state = shared.lock();

        for batch in batches {
            if batch.is_empty() {
                continue;
            }
            let partition = batch.partition().clone();
            self.known_topics.insert(partition.topic().to_string());

            let singles = batch.into_single_records();
            metrics::counter!(BATCHES_STARTED, "topic" => partition.topic().to_string())
                .increment(singles.len() as u64);
            let processors = state.in_flight.entry(partition).or_default();
            for single in singles {
                let processor = Arc::new(BatchProcessor::new(single));
                self.pool.submit(processor.clone(), self.handler.clone());
                processors.push(processor);
            }
        }

        let in_flight: usize = state.in_flight.values().map(Vec::len).sum();
        metrics::gauge!(ACTIVE_PROCESSORS).set(in_flight as f64);

        let idle = polled == 0 && state.ledger.is_empty();

        self.log_monitor(&state);
        self.scheduler
            .maybe_commit(&mut state.ledger, &self.broker, false);

        if idle {
            CycleOutcome::Idle
        } else {
            CycleOutcome::Busy
        }
    }

    fn revoke(&mut self, partitions: &[Partition]) {
        self.coordinator.revoke(partitions, &self.broker);
    }

    fn pause_all(&self) {
        self.gate.controls().trigger_pausing();
    }

    fn resume_all(&self) {
        self.gate.controls().trigger_resuming();
    }

    fn shutdown(&mut self) {
        info!("Shutting down unordered dispatcher");

        if !self.settle_in_flight() {
            debug!("Work still in flight at shutdown, leaving it to the revoke on close");
        }
        {
            let shared = self.state.clone();
            let mut state = shared.lock();
            self.scheduler
                .maybe_commit(&mut state.ledger, &self.broker, true);
        }

        self.broker.close();

        if !self.pool.shutdown(self.settings.shutdown_timeout) {
            error!(
                timeout_ms = self.settings.shutdown_timeout.as_millis() as u64,
                in_flight = self.pool.in_flight(),
                "Timed out waiting for worker pool to terminate"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_batch;

    fn p(num: i32) -> Partition {
        Partition::new("topic".to_string(), num)
    }

    #[test]
    fn test_drain_commits_nothing_new_when_a_record_was_not_processed() {
        let mut state = UnorderedState::new();
        state.ledger.record(&p(0), 5);
        let processors: Vec<Arc<BatchProcessor>> = test_batch("topic", 0, 5..7)
            .into_single_records()
            .into_iter()
            .map(|b| Arc::new(BatchProcessor::new(b)))
            .collect();
        state.in_flight.insert(p(0), processors);

        let staged = state.drain_revoked(&[p(0)], Duration::from_millis(10));

        // the earlier, fully completed poll is still committed
        assert_eq!(staged, HashMap::from([(p(0), 5)]));
        assert!(state.in_flight.is_empty());
        assert!(state.ledger.is_empty());
    }

    #[test]
    fn test_settle_records_highest_offset() {
        let mut state = UnorderedState::new();
        let processors: Vec<Arc<BatchProcessor>> = test_batch("topic", 0, 0..3)
            .into_single_records()
            .into_iter()
            .map(|b| Arc::new(BatchProcessor::new(b)))
            .collect();
        for processor in &processors {
            processor.stop_processing();
        }
        state.in_flight.insert(p(0), processors);

        assert!(state.pending().is_empty());
        state.settle();

        // stopped before starting, so nothing to record
        assert!(state.ledger.is_empty());
        assert!(state.in_flight.is_empty());
    }
}
