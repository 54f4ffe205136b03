use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::batch_processor::BatchProcessor;
use crate::metrics_consts::BATCHES_DEFERRED;
use crate::offset_ledger::OffsetLedger;
use crate::partition_monitor::PartitionMonitor;
use crate::rebalance_coordinator::{record_drain, DrainResult, RevocationDrain};
use crate::types::{Partition, RecordBatch};

/// Everything the ordered dispatcher and the rebalance coordinator both touch.
#[derive(Default)]
pub struct DispatchState {
    /// At most one processor per partition
    pub active: HashMap<Partition, Arc<BatchProcessor>>,
    /// Records that arrived while the partition's processor was still active
    pub deferred: HashMap<Partition, RecordBatch>,
    pub ledger: OffsetLedger,
    pub monitor: PartitionMonitor,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_active(&self, partition: &Partition) -> bool {
        self.active.contains_key(partition)
    }

    /// Hold `batch` until the partition's current processor is done.
    pub fn defer(&mut self, batch: RecordBatch) {
        let partition = batch.partition().clone();
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            batch_size = batch.len(),
            "Partition still busy, deferring batch"
        );
        metrics::counter!(BATCHES_DEFERRED, "topic" => partition.topic().to_string()).increment(1);

        match self.deferred.entry(partition) {
            Entry::Occupied(mut existing) => existing.get_mut().extend(batch),
            Entry::Vacant(slot) => {
                slot.insert(batch);
            }
        }
    }

    /// Move the progress of every active processor into the ledger, and return the
    /// partitions whose processor is done.
    pub fn harvest(&mut self) -> Vec<Partition> {
        let mut done = Vec::new();
        for (partition, processor) in &self.active {
            // completion is read before progress so a done processor's offset is final
            let is_done = processor.is_done();
            if let Some(offset) = processor.committable_offset() {
                self.ledger.record(partition, offset);
            }
            if is_done {
                done.push(partition.clone());
            }
        }
        done
    }
}

impl RevocationDrain for DispatchState {
    fn drain_revoked(
        &mut self,
        partitions: &[Partition],
        drain_timeout: Duration,
    ) -> HashMap<Partition, i64> {
        // stop everything first so the processors wind down in parallel
        let mut draining = Vec::new();
        for partition in partitions {
            if let Some(dropped) = self.deferred.remove(partition) {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    records = dropped.len(),
                    "Dropping deferred records of revoked partition"
                );
            }
            if let Some(processor) = self.active.remove(partition) {
                processor.stop_processing();
                draining.push((partition.clone(), processor));
            }
        }

        let mut staged = self.ledger.take(partitions);

        for (partition, processor) in draining {
            let offset = processor.wait_for_completion(drain_timeout);
            if offset > 0 {
                staged.insert(partition.clone(), offset);
                record_drain(&partition, DrainResult::Drained, drain_timeout);
            } else if processor.is_done() {
                // an earlier finished batch may still have its offset in the ledger
                record_drain(&partition, DrainResult::NotStarted, drain_timeout);
            } else {
                staged.remove(&partition);
                record_drain(&partition, DrainResult::TimedOut, drain_timeout);
            }
        }

        for partition in partitions {
            self.monitor.remove(partition);
        }

        staged
    }
}
