//! Shared test utilities: an in-memory broker and a recording request executor.
//!
//! Used by the unit tests of this crate and by the integration tests in `tests/`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::broker::{BrokerClient, BrokerError, CommitMode, OffsetCommitter, RebalanceListener};
use crate::request::{Authentication, RequestExecutor, UnitOfWork};
use crate::types::{Partition, Record, RecordBatch};

/// A request envelope with a small request body.
pub fn request_payload(authentication: Option<Authentication>) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "authentication": authentication,
        "message_id": "test-message",
        "request": {"op": "test"},
    }))
    .expect("test payload serializes")
}

/// A batch of well-formed records without credentials at `offsets`.
pub fn test_batch(topic: &str, partition: i32, offsets: Range<i64>) -> RecordBatch {
    let records = offsets
        .map(|offset| Record::new(offset, None, Some(request_payload(None))))
        .collect();
    RecordBatch::new(Partition::new(topic.to_string(), partition), records)
}

enum RebalanceEvent {
    Revoke(Vec<Partition>),
    Assign(Vec<Partition>),
}

#[derive(Default)]
struct MockBrokerInner {
    assignment: BTreeSet<Partition>,
    paused: HashSet<Partition>,
    /// Records still in the log, delivered while the partition is assigned and not paused
    backlog: HashMap<Partition, VecDeque<Record>>,
    /// Batches delivered by the next polls whatever the pause state, like prefetched data
    prefetched: VecDeque<Vec<RecordBatch>>,
    poll_errors: VecDeque<String>,
    rebalances: VecDeque<RebalanceEvent>,
    listener: Option<Arc<dyn RebalanceListener>>,
    max_per_poll: usize,
    poll_count: usize,
    pause_calls: usize,
    resume_calls: usize,
    commits: Vec<(HashMap<Partition, i64>, CommitMode)>,
    committed: HashMap<Partition, i64>,
    commit_attempts: usize,
    fail_commits: bool,
    closed: bool,
}

/// In-memory [`BrokerClient`]. Clones share state, so a test can keep a handle to the
/// broker it gave to a dispatcher.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Mutex<MockBrokerInner>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockBrokerInner {
                max_per_poll: 500,
                ..Default::default()
            })),
        }
    }

    pub fn with_assignment(partitions: Vec<Partition>) -> Self {
        let broker = Self::new();
        broker.inner.lock().assignment.extend(partitions);
        broker
    }

    pub fn set_listener(&self, listener: Arc<dyn RebalanceListener>) {
        self.inner.lock().listener = Some(listener);
    }

    /// Limit the records a poll returns per partition.
    pub fn set_max_per_poll(&self, max: usize) {
        self.inner.lock().max_per_poll = max.max(1);
    }

    /// Append records at `offsets` to the log of `partition`.
    pub fn push_records(&self, partition: &Partition, offsets: Range<i64>) {
        let batch = test_batch(partition.topic(), partition.partition_number(), offsets);
        self.push_batch_to_log(batch);
    }

    pub fn push_batch_to_log(&self, batch: RecordBatch) {
        let partition = batch.partition().clone();
        let mut inner = self.inner.lock();
        inner
            .backlog
            .entry(partition)
            .or_default()
            .extend(batch.records().iter().cloned());
    }

    /// Deliver `batches` from the next poll, even for paused partitions.
    pub fn push_prefetched(&self, batches: Vec<RecordBatch>) {
        self.inner.lock().prefetched.push_back(batches);
    }

    pub fn fail_next_poll(&self, message: &str) {
        self.inner.lock().poll_errors.push_back(message.to_string());
    }

    /// Revoke `partitions` from inside the next poll.
    pub fn schedule_revoke(&self, partitions: Vec<Partition>) {
        self.inner
            .lock()
            .rebalances
            .push_back(RebalanceEvent::Revoke(partitions));
    }

    /// Assign `partitions` from inside the next poll.
    pub fn schedule_assign(&self, partitions: Vec<Partition>) {
        self.inner
            .lock()
            .rebalances
            .push_back(RebalanceEvent::Assign(partitions));
    }

    pub fn fail_commits(&self, fail: bool) {
        self.inner.lock().fail_commits = fail;
    }

    pub fn paused(&self) -> Vec<Partition> {
        self.inner.lock().paused.iter().cloned().collect()
    }

    pub fn is_paused(&self, partition: &Partition) -> bool {
        self.inner.lock().paused.contains(partition)
    }

    pub fn pause_calls(&self) -> usize {
        self.inner.lock().pause_calls
    }

    pub fn resume_calls(&self) -> usize {
        self.inner.lock().resume_calls
    }

    pub fn poll_count(&self) -> usize {
        self.inner.lock().poll_count
    }

    /// Successful commits, in order.
    pub fn commits(&self) -> Vec<(HashMap<Partition, i64>, CommitMode)> {
        self.inner.lock().commits.clone()
    }

    pub fn commit_attempts(&self) -> usize {
        self.inner.lock().commit_attempts
    }

    /// Latest committed offset of `partition`.
    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.inner.lock().committed.get(partition).copied()
    }

    pub fn backlog_len(&self, partition: &Partition) -> usize {
        self.inner
            .lock()
            .backlog
            .get(partition)
            .map_or(0, VecDeque::len)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn deliver_rebalances(&self) {
        loop {
            let (event, listener) = {
                let mut inner = self.inner.lock();
                match inner.rebalances.pop_front() {
                    Some(event) => (event, inner.listener.clone()),
                    None => return,
                }
            };

            // the listener commits through this broker, so the lock must be released
            match event {
                RebalanceEvent::Revoke(partitions) => {
                    if let Some(listener) = listener {
                        listener.on_partitions_revoked(&partitions, self);
                    }
                    let mut inner = self.inner.lock();
                    for partition in &partitions {
                        inner.assignment.remove(partition);
                        inner.paused.remove(partition);
                    }
                }
                RebalanceEvent::Assign(partitions) => {
                    self.inner
                        .lock()
                        .assignment
                        .extend(partitions.iter().cloned());
                    if let Some(listener) = listener {
                        listener.on_partitions_assigned(&partitions);
                    }
                }
            }
        }
    }
}

impl OffsetCommitter for MockBroker {
    fn commit(
        &self,
        offsets: &HashMap<Partition, i64>,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        inner.commit_attempts += 1;
        if inner.fail_commits {
            return Err(BrokerError::Unavailable("commit rejected".to_string()));
        }
        for (partition, offset) in offsets {
            inner.committed.insert(partition.clone(), *offset);
        }
        inner.commits.push((offsets.clone(), mode));
        Ok(())
    }
}

impl BrokerClient for MockBroker {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<RecordBatch>, BrokerError> {
        self.deliver_rebalances();

        let batches = {
            let mut inner = self.inner.lock();
            inner.poll_count += 1;
            if inner.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(message) = inner.poll_errors.pop_front() {
                return Err(BrokerError::Unavailable(message));
            }

            if let Some(prefetched) = inner.prefetched.pop_front() {
                prefetched
            } else {
                let max = inner.max_per_poll;
                let deliverable: Vec<Partition> = inner
                    .assignment
                    .iter()
                    .filter(|p| !inner.paused.contains(*p))
                    .cloned()
                    .collect();
                let mut batches = Vec::new();
                for partition in deliverable {
                    if let Some(log) = inner.backlog.get_mut(&partition) {
                        let take = log.len().min(max);
                        if take > 0 {
                            let records: Vec<Record> = log.drain(..take).collect();
                            batches.push(RecordBatch::new(partition, records));
                        }
                    }
                }
                batches
            }
        };

        if batches.is_empty() {
            std::thread::sleep(timeout);
        }
        Ok(batches)
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        inner.pause_calls += 1;
        inner.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        inner.resume_calls += 1;
        for partition in partitions {
            inner.paused.remove(partition);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, BrokerError> {
        Ok(self.inner.lock().assignment.iter().cloned().collect())
    }

    fn close(&mut self) {
        let (assigned, listener) = {
            let inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let assigned: Vec<Partition> = inner.assignment.iter().cloned().collect();
            (assigned, inner.listener.clone())
        };

        if let (Some(listener), false) = (listener, assigned.is_empty()) {
            listener.on_partitions_revoked(&assigned, &*self);
        }

        let mut inner = self.inner.lock();
        inner.assignment.clear();
        inner.paused.clear();
        inner.closed = true;
    }
}

#[derive(Default)]
struct RecordingInner {
    executed: Vec<UnitOfWork>,
    running: usize,
    max_running: usize,
    running_by_partition: HashMap<Partition, usize>,
    max_running_by_partition: usize,
}

/// [`RequestExecutor`] that records every call and can fail, panic or slow down.
#[derive(Default)]
pub struct RecordingExecutor {
    inner: Mutex<RecordingInner>,
    failing: HashSet<i64>,
    panicking: HashSet<i64>,
    delay: Duration,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error for records at these offsets.
    pub fn failing_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.failing.extend(offsets);
        self
    }

    /// Panic for records at these offsets.
    pub fn panicking_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.panicking.extend(offsets);
        self
    }

    /// Take `delay` to execute each record.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every unit of work handed to the executor, in call order.
    pub fn executed(&self) -> Vec<UnitOfWork> {
        self.inner.lock().executed.clone()
    }

    pub fn executed_offsets(&self) -> Vec<i64> {
        self.inner
            .lock()
            .executed
            .iter()
            .map(|w| w.offset)
            .collect()
    }

    pub fn executed_offsets_for(&self, partition: &Partition) -> Vec<i64> {
        self.inner
            .lock()
            .executed
            .iter()
            .filter(|w| &w.partition == partition)
            .map(|w| w.offset)
            .collect()
    }

    /// Highest number of records executing at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.inner.lock().max_running
    }

    /// Highest number of records of a single partition executing at the same time.
    pub fn max_partition_concurrency(&self) -> usize {
        self.inner.lock().max_running_by_partition
    }
}

#[async_trait]
impl RequestExecutor for RecordingExecutor {
    async fn execute(&self, work: UnitOfWork) -> anyhow::Result<()> {
        let offset = work.offset;
        let partition = work.partition.clone();
        {
            let mut inner = self.inner.lock();
            inner.executed.push(work);
            inner.running += 1;
            inner.max_running = inner.max_running.max(inner.running);
            let running = {
                let count = inner
                    .running_by_partition
                    .entry(partition.clone())
                    .or_default();
                *count += 1;
                *count
            };
            inner.max_running_by_partition = inner.max_running_by_partition.max(running);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut inner = self.inner.lock();
            inner.running -= 1;
            if let Some(count) = inner.running_by_partition.get_mut(&partition) {
                *count -= 1;
            }
        }

        if self.panicking.contains(&offset) {
            panic!("executor panic at offset {offset}");
        }
        if self.failing.contains(&offset) {
            return Err(anyhow!("executor failure at offset {offset}"));
        }
        Ok(())
    }
}
