//! Partition-ordered dispatch.
//!
//! Each partition has at most one active [`BatchProcessor`]. While it runs, the partition
//! is paused at the broker; records that were already fetched are deferred and become the
//! partition's next batch. Offsets are harvested from running processors every cycle and
//! flushed by the [`CommitScheduler`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::state::DispatchState;
use super::{CycleOutcome, Dispatcher, DispatcherSettings};
use crate::batch_processor::BatchProcessor;
use crate::broker::{BrokerClient, RebalanceListener};
use crate::commit_scheduler::CommitScheduler;
use crate::metrics_consts::{ACTIVE_PROCESSORS, BATCHES_STARTED, POLL_ERRORS, RECORDS_POLLED};
use crate::partition_gate::{OperationalControls, PartitionGate};
use crate::rebalance_coordinator::RebalanceCoordinator;
use crate::request::RequestHandler;
use crate::types::{Partition, RecordBatch};
use crate::worker_pool::WorkerPool;

pub struct OrderedDispatcher<B> {
    broker: B,
    state: Arc<Mutex<DispatchState>>,
    coordinator: Arc<RebalanceCoordinator<DispatchState>>,
    gate: PartitionGate,
    scheduler: CommitScheduler,
    pool: WorkerPool,
    handler: Arc<RequestHandler>,
    settings: DispatcherSettings,
    known_topics: BTreeSet<String>,
    last_monitor_log: Instant,
}

impl<B: BrokerClient> OrderedDispatcher<B> {
    /// Build the dispatcher. `connect` receives the rebalance listener the broker client
    /// must invoke, and returns the client.
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
        let state = Arc::new(Mutex::new(DispatchState::new()));
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

    fn start_processor(&mut self, state: &mut DispatchState, batch: RecordBatch) {
        let partition = batch.partition().clone();
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            batch_size = batch.len(),
            first_offset = batch.first_offset(),
            "Starting batch processor"
        );

        let processor = Arc::new(BatchProcessor::new(batch));
        self.pool.submit(processor.clone(), self.handler.clone());
        state.active.insert(partition.clone(), processor.clone());
        self.gate
            .pause(&mut self.broker, &mut state.monitor, &partition, processor);

        metrics::counter!(BATCHES_STARTED, "topic" => partition.topic().to_string()).increment(1);
    }

    /// Retire done processors: start the deferred batch if there is one, otherwise
    /// resume the partition.
    fn retire(&mut self, state: &mut DispatchState, done: Vec<Partition>) {
        let mut to_resume = Vec::with_capacity(done.len());
        for partition in done {
            state.active.remove(&partition);
            match state.deferred.remove(&partition) {
                Some(next) => self.start_processor(state, next),
                None => to_resume.push(partition),
            }
        }
        self.gate
            .resume(&mut self.broker, &mut state.monitor, &to_resume);
    }

    fn log_monitor(&mut self, state: &DispatchState) {
        let now = Instant::now();
        if now.duration_since(self.last_monitor_log) < self.settings.monitor_interval {
            return;
        }
        self.last_monitor_log = now;

        let snapshot = state.monitor.snapshot(now);
        if !snapshot.is_empty() {
            debug!("Paused partitions: {}", snapshot.log_line());
        }
        let topics: Vec<String> = self.known_topics.iter().cloned().collect();
        snapshot.publish(&topics);
    }
}

impl<B: BrokerClient> Dispatcher for OrderedDispatcher<B> {
    fn poll_cycle(&mut self) -> CycleOutcome {
        let shared = self.state.clone();

        {
            let mut state = shared.lock();
            self.gate
                .apply_global_triggers(&mut self.broker, &mut state.monitor);
        }

        // rebalance callbacks fire inside poll and take the state lock
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
            self.known_topics
                .insert(batch.partition().topic().to_string());
            if state.has_active(batch.partition()) {
                state.defer(batch);
            } else {
                self.start_processor(&mut state, batch);
            }
        }

        let idle = polled == 0 && state.active.is_empty() && state.ledger.is_empty();

        let done = state.harvest();
        if !done.is_empty() {
            self.retire(&mut state, done);
        }
        metrics::gauge!(ACTIVE_PROCESSORS).set(state.active.len() as f64);

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
        info!("Shutting down ordered dispatcher");

        {
            let shared = self.state.clone();
            let mut state = shared.lock();
            state.harvest();
            self.scheduler
                .maybe_commit(&mut state.ledger, &self.broker, true);
        }

        // revokes the remaining assignment through the coordinator
        self.broker.close();

        if self.pool.shutdown(self.settings.shutdown_timeout) {
            info!("Worker pool terminated");
        } else {
            error!(
                timeout_ms = self.settings.shutdown_timeout.as_millis() as u64,
                in_flight = self.pool.in_flight(),
                "Timed out waiting for worker pool to terminate"
            );
        }
    }
}
