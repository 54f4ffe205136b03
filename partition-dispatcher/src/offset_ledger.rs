//! Offset Ledger - Tracks, per partition, the next offset that is safe to commit
//!
//! Entries are fed by harvesting batch processor progress and drained by the commit
//! scheduler or the rebalance coordinator. An entry only ever moves forward: every value
//! stored is `last processed offset + 1` of some record that has actually been handled.
//! Offsets already handed out for commit are remembered, so a processor that makes no
//! progress between commits does not get its offset committed again.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::metrics_consts::LEDGER_STALE_OFFSET;
use crate::types::Partition;

#[derive(Debug, Default)]
pub struct OffsetLedger {
    pending: HashMap<Partition, i64>,
    /// Highest offset drained for commit, per partition
    flushed: HashMap<Partition, i64>,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `next_offset` for `partition`.
    ///
    /// Returns `true` if the entry was created or advanced. A value at or below the
    /// current entry is ignored; a lower value is logged and counted. A value at or
    /// below the last drained offset is ignored silently.
    pub fn record(&mut self, partition: &Partition, next_offset: i64) -> bool {
        if self
            .flushed
            .get(partition)
            .is_some_and(|flushed| next_offset <= *flushed)
        {
            return false;
        }

        match self.pending.get_mut(partition) {
            Some(current) if next_offset > *current => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    previous_offset = *current,
                    new_offset = next_offset,
                    "Advancing committable offset"
                );
                *current = next_offset;
                true
            }
            Some(current) => {
                if next_offset < *current {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        current_offset = *current,
                        stale_offset = next_offset,
                        "Ignoring stale offset for partition"
                    );
                    metrics::counter!(
                        LEDGER_STALE_OFFSET,
                        "topic" => partition.topic().to_string()
                    )
                    .increment(1);
                }
                false
            }
            None => {
                self.pending.insert(partition.clone(), next_offset);
                true
            }
        }
    }

    pub fn get(&self, partition: &Partition) -> Option<i64> {
        self.pending.get(partition).copied()
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.pending.contains_key(partition)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Take every pending entry for commit, leaving the ledger empty.
    pub fn drain_all(&mut self) -> HashMap<Partition, i64> {
        let drained = std::mem::take(&mut self.pending);
        for (partition, offset) in &drained {
            self.flushed.insert(partition.clone(), *offset);
        }
        drained
    }

    /// Remove everything known about `partitions` and return the pending entries that
    /// existed. Used when the partitions are revoked.
    pub fn take(&mut self, partitions: &[Partition]) -> HashMap<Partition, i64> {
        for partition in partitions {
            self.flushed.remove(partition);
        }
        partitions
            .iter()
            .filter_map(|p| self.pending.remove_entry(p))
            .collect()
    }

    /// Put back entries whose commit failed. Values recorded since the drain win.
    pub fn restore(&mut self, offsets: HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            self.pending
                .entry(partition)
                .and_modify(|current| *current = (*current).max(offset))
                .or_insert(offset);
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.flushed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    #[test]
    fn test_record_initializes_offset() {
        let mut ledger = OffsetLedger::new();
        let partition = test_partition(0);

        assert!(ledger.record(&partition, 100));
        assert_eq!(ledger.get(&partition), Some(100));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_record_never_goes_backwards() {
        let mut ledger = OffsetLedger::new();
        let partition = test_partition(0);

        ledger.record(&partition, 200);
        assert!(!ledger.record(&partition, 150));
        assert!(!ledger.record(&partition, 200));
        assert_eq!(ledger.get(&partition), Some(200));

        assert!(ledger.record(&partition, 201));
        assert_eq!(ledger.get(&partition), Some(201));
    }

    #[test]
    fn test_drain_all_empties_ledger() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 10);
        ledger.record(&test_partition(1), 20);

        let drained = ledger.drain_all();

        assert_eq!(drained.len(), 2);
        assert_eq!(drained.get(&test_partition(1)), Some(&20));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_drained_offset_is_not_recorded_again() {
        let mut ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.record(&partition, 10);
        ledger.drain_all();

        // a long batch reporting the same progress on every sweep
        assert!(!ledger.record(&partition, 10));
        assert!(ledger.is_empty());

        assert!(ledger.record(&partition, 11));
        assert_eq!(ledger.get(&partition), Some(11));
    }

    #[test]
    fn test_take_forgets_drained_offsets() {
        let mut ledger = OffsetLedger::new();
        let partition = test_partition(0);
        ledger.record(&partition, 10);
        ledger.drain_all();

        ledger.take(&[partition.clone()]);

        // reassigned later, the partition starts over from the committed offset
        assert!(ledger.record(&partition, 10));
    }

    #[test]
    fn test_take_only_removes_requested_partitions() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 10);
        ledger.record(&test_partition(1), 20);

        let taken = ledger.take(&[test_partition(1), test_partition(7)]);

        assert_eq!(taken.len(), 1);
        assert_eq!(taken.get(&test_partition(1)), Some(&20));
        assert!(ledger.contains(&test_partition(0)));
        assert!(!ledger.contains(&test_partition(1)));
    }

    #[test]
    fn test_restore_keeps_newer_values() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 10);
        ledger.record(&test_partition(1), 20);
        let drained = ledger.drain_all();

        // progress harvested while the commit was in flight
        ledger.record(&test_partition(0), 15);

        ledger.restore(drained);

        assert_eq!(ledger.get(&test_partition(0)), Some(15));
        assert_eq!(ledger.get(&test_partition(1)), Some(20));
    }

    #[test]
    fn test_clear() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 10);
        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(ledger.get(&test_partition(0)), None);
    }
}
