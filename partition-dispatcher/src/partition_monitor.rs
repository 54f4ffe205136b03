//! Partition Monitor - observability records for paused partitions
//!
//! A partition has an entry exactly while it is paused at the broker. The entry remembers
//! when the pause started and which batch processor (if any) the partition is waiting on,
//! which is enough to report how long each partition has been busy and how much of its
//! batch is still pending. Nothing here is used for correctness.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch_processor::BatchProcessor;
use crate::metrics_consts::{
    MONITOR_PAUSED_PARTITIONS, MONITOR_PROCESSING_TIME_AVG, MONITOR_PROCESSING_TIME_TOTAL,
    MONITOR_TASKS_PENDING, MONITOR_TASKS_TOTAL,
};
use crate::types::Partition;

struct MonitorEntry {
    paused_at: Instant,
    processor: Option<Arc<BatchProcessor>>,
}

#[derive(Default)]
pub struct PartitionMonitor {
    entries: HashMap<Partition, MonitorEntry>,
}

impl PartitionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a pause. Returns `false` if the partition was already tracked.
    pub fn record_pause(
        &mut self,
        partition: &Partition,
        paused_at: Instant,
        processor: Option<Arc<BatchProcessor>>,
    ) -> bool {
        if self.entries.contains_key(partition) {
            return false;
        }
        self.entries.insert(
            partition.clone(),
            MonitorEntry {
                paused_at,
                processor,
            },
        );
        true
    }

    /// Point an existing entry at the processor now running for the partition.
    pub fn attach_processor(&mut self, partition: &Partition, processor: Arc<BatchProcessor>) {
        if let Some(entry) = self.entries.get_mut(partition) {
            entry.processor = Some(processor);
        }
    }

    /// Forget the processor of an entry that stays paused.
    pub fn detach_processor(&mut self, partition: &Partition) {
        if let Some(entry) = self.entries.get_mut(partition) {
            entry.processor = None;
        }
    }

    pub fn has_processor(&self, partition: &Partition) -> bool {
        self.entries
            .get(partition)
            .is_some_and(|entry| entry.processor.is_some())
    }

    pub fn remove(&mut self, partition: &Partition) -> bool {
        self.entries.remove(partition).is_some()
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.entries.contains_key(partition)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.entries.keys().cloned().collect()
    }

    pub fn snapshot(&self, now: Instant) -> MonitorSnapshot {
        let mut partitions: Vec<PartitionSnapshot> = self
            .entries
            .iter()
            .map(|(partition, entry)| {
                let (pending, total, last_offset) = match &entry.processor {
                    Some(p) => (p.pending(), p.total(), p.committable_offset()),
                    None => (0, 0, None),
                };
                PartitionSnapshot {
                    partition: partition.clone(),
                    paused_for: now.saturating_duration_since(entry.paused_at),
                    pending,
                    total,
                    last_offset,
                }
            })
            .collect();
        partitions.sort_by(|a, b| a.partition.cmp(&b.partition));

        MonitorSnapshot { partitions }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub partition: Partition,
    pub paused_for: Duration,
    pub pending: usize,
    pub total: usize,
    pub last_offset: Option<i64>,
}

impl fmt::Display for PartitionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}):[PausedSince: {}ms, Pending: {}/{}, LastOffset: ",
            self.partition.partition_number(),
            self.paused_for.as_millis(),
            self.pending,
            self.total
        )?;
        match self.last_offset {
            Some(offset) => write!(f, "{offset}]"),
            None => write!(f, "not-started]"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub partitions: Vec<PartitionSnapshot>,
}

/// Aggregates for one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicTotals {
    pub paused: usize,
    pub processing_time: Duration,
    pub pending: usize,
    pub total: usize,
}

impl TopicTotals {
    pub fn average_processing_time(&self) -> Duration {
        match u32::try_from(self.paused) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.processing_time / n,
        }
    }
}

impl MonitorSnapshot {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn totals_by_topic(&self) -> BTreeMap<String, TopicTotals> {
        let mut totals: BTreeMap<String, TopicTotals> = BTreeMap::new();
        for p in &self.partitions {
            let entry = totals.entry(p.partition.topic().to_string()).or_default();
            entry.paused += 1;
            entry.processing_time += p.paused_for;
            entry.pending += p.pending;
            entry.total += p.total;
        }
        totals
    }

    /// The monitor log line, one segment per paused partition.
    pub fn log_line(&self) -> String {
        self.partitions
            .iter()
            .map(PartitionSnapshot::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Publish aggregate gauges per topic. Topics in `known_topics` with no paused
    /// partitions are reset to zero so gauges do not go stale.
    pub fn publish(&self, known_topics: &[String]) {
        let totals = self.totals_by_topic();

        for topic in known_topics {
            if !totals.contains_key(topic) {
                set_topic_gauges(topic, &TopicTotals::default());
            }
        }
        for (topic, t) in &totals {
            set_topic_gauges(topic, t);
        }
    }
}

fn set_topic_gauges(topic: &str, totals: &TopicTotals) {
    let labels = [("topic", topic.to_string())];
    metrics::gauge!(MONITOR_PAUSED_PARTITIONS, &labels).set(totals.paused as f64);
    metrics::gauge!(MONITOR_PROCESSING_TIME_TOTAL, &labels)
        .set(totals.processing_time.as_millis() as f64);
    metrics::gauge!(MONITOR_PROCESSING_TIME_AVG, &labels)
        .set(totals.average_processing_time().as_millis() as f64);
    metrics::gauge!(MONITOR_TASKS_PENDING, &labels).set(totals.pending as f64);
    metrics::gauge!(MONITOR_TASKS_TOTAL, &labels).set(totals.total as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_batch;

    fn p(num: i32) -> Partition {
        Partition::new("topic".to_string(), num)
    }

    #[test]
    fn test_record_pause_is_idempotent() {
        let mut monitor = PartitionMonitor::new();
        let start = Instant::now();

        assert!(monitor.record_pause(&p(0), start, None));
        assert!(!monitor.record_pause(&p(0), start + Duration::from_secs(1), None));
        assert_eq!(monitor.len(), 1);

        let snapshot = monitor.snapshot(start + Duration::from_millis(1500));
        assert_eq!(
            snapshot.partitions[0].paused_for,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_snapshot_reads_processor_progress() {
        let mut monitor = PartitionMonitor::new();
        let start = Instant::now();
        let processor = Arc::new(BatchProcessor::new(test_batch("topic", 1, 10..14)));

        monitor.record_pause(&p(1), start, Some(processor));
        monitor.record_pause(&p(0), start, None);

        let snapshot = monitor.snapshot(start + Duration::from_millis(250));
        assert_eq!(snapshot.partitions.len(), 2);
        assert_eq!(snapshot.partitions[0].partition, p(0));
        assert_eq!(snapshot.partitions[1].pending, 4);
        assert_eq!(snapshot.partitions[1].total, 4);
        assert_eq!(snapshot.partitions[1].last_offset, None);

        assert_eq!(
            snapshot.log_line(),
            "(0):[PausedSince: 250ms, Pending: 0/0, LastOffset: not-started], \
             (1):[PausedSince: 250ms, Pending: 4/4, LastOffset: not-started]"
        );
    }

    #[test]
    fn test_attach_and_detach_processor() {
        let mut monitor = PartitionMonitor::new();
        monitor.record_pause(&p(0), Instant::now(), None);
        assert!(!monitor.has_processor(&p(0)));

        let processor = Arc::new(BatchProcessor::new(test_batch("topic", 0, 0..2)));
        monitor.attach_processor(&p(0), processor);
        assert!(monitor.has_processor(&p(0)));

        monitor.detach_processor(&p(0));
        assert!(!monitor.has_processor(&p(0)));
        assert!(monitor.contains(&p(0)));

        // attaching to an unknown partition does not create an entry
        let other = Arc::new(BatchProcessor::new(test_batch("topic", 5, 0..1)));
        monitor.attach_processor(&p(5), other);
        assert!(!monitor.contains(&p(5)));
    }

    #[test]
    fn test_totals_by_topic() {
        let mut monitor = PartitionMonitor::new();
        let start = Instant::now();
        monitor.record_pause(
            &p(0),
            start,
            Some(Arc::new(BatchProcessor::new(test_batch("topic", 0, 0..3)))),
        );
        monitor.record_pause(
            &p(1),
            start + Duration::from_millis(100),
            Some(Arc::new(BatchProcessor::new(test_batch("topic", 1, 0..5)))),
        );

        let snapshot = monitor.snapshot(start + Duration::from_millis(300));
        let totals = snapshot.totals_by_topic();
        let t = &totals["topic"];

        assert_eq!(t.paused, 2);
        assert_eq!(t.processing_time, Duration::from_millis(500));
        assert_eq!(t.average_processing_time(), Duration::from_millis(250));
        assert_eq!(t.pending, 8);
        assert_eq!(t.total, 8);
    }

    #[test]
    fn test_remove() {
        let mut monitor = PartitionMonitor::new();
        monitor.record_pause(&p(0), Instant::now(), None);
        assert!(monitor.remove(&p(0)));
        assert!(!monitor.remove(&p(0)));
        assert!(monitor.is_empty());
        assert!(monitor.snapshot(Instant::now()).is_empty());
    }
}
