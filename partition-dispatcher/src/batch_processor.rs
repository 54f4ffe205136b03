//! Batch Processor - executes one partition batch, record by record, in offset order
//!
//! The dispatcher owns the processor's lifecycle; a worker task drives [`BatchProcessor::run`].
//! Progress is published through atomics after every record, so the dispatcher can harvest
//! partial progress while the batch is still running, and the rebalance coordinator can stop
//! it cooperatively between records.
//!
//! ```text
//!   Created ──run()──▶ Running ──all records──▶ Finished
//!      │                  │
//!      │           stop flag seen
//!      │                  ▼
//!      └─stop_processing()──▶ Stopped
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::metrics_consts::BATCH_DURATION;
use crate::request::RequestHandler;
use crate::types::{Partition, RecordBatch};

/// Offset reported when nothing has been processed.
pub const NOTHING_PROCESSED: i64 = -1;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const STOPPED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Running,
    Finished,
    Stopped,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            CREATED => ProcessorState::Created,
            RUNNING => ProcessorState::Running,
            FINISHED => ProcessorState::Finished,
            _ => ProcessorState::Stopped,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessorState::Finished | ProcessorState::Stopped)
    }
}

pub struct BatchProcessor {
    batch: RecordBatch,
    state: AtomicU8,
    stop_requested: AtomicBool,
    /// Offset of the last handled record + 1, or [`NOTHING_PROCESSED`]
    last_processed_offset: AtomicI64,
    processed: AtomicUsize,
    created_at: Instant,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl BatchProcessor {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            state: AtomicU8::new(CREATED),
            stop_requested: AtomicBool::new(false),
            last_processed_offset: AtomicI64::new(NOTHING_PROCESSED),
            processed: AtomicUsize::new(0),
            created_at: Instant::now(),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        }
    }

    pub fn partition(&self) -> &Partition {
        self.batch.partition()
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.batch.len()
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.total().saturating_sub(self.processed())
    }

    pub fn last_processed_offset(&self) -> i64 {
        self.last_processed_offset.load(Ordering::Acquire)
    }

    /// The offset to commit for the progress made so far, if any.
    pub fn committable_offset(&self) -> Option<i64> {
        let offset = self.last_processed_offset();
        (offset > 0).then_some(offset)
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Execute the batch. Returns the terminal state reached.
    ///
    /// A processor that was stopped before a worker picked it up returns immediately
    /// without touching any record.
    pub async fn run(&self, handler: &RequestHandler) -> ProcessorState {
        let partition = self.batch.partition();

        if self
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Batch processor was stopped before it started"
            );
            return self.state();
        }

        let started = Instant::now();
        let mut final_state = ProcessorState::Finished;

        for record in self.batch.records() {
            if self.is_stop_requested() {
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    processed = self.processed(),
                    remaining = self.pending(),
                    "Batch processor stopped before offset {}",
                    record.offset()
                );
                final_state = ProcessorState::Stopped;
                break;
            }

            handler.handle(partition, record).await;

            // consumption progress, independent of the record outcome
            self.last_processed_offset
                .store(record.offset() + 1, Ordering::Release);
            self.processed.fetch_add(1, Ordering::AcqRel);
        }

        metrics::histogram!(BATCH_DURATION, "topic" => partition.topic().to_string())
            .record(started.elapsed().as_secs_f64());

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            processed = self.processed(),
            last_offset = self.last_processed_offset(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch processor completed"
        );

        self.complete(final_state);
        final_state
    }

    /// Ask the processor to stop before its next record.
    ///
    /// A processor that has not started yet is stopped immediately with nothing processed.
    pub fn stop_processing(&self) {
        self.stop_requested.store(true, Ordering::Release);

        if self
            .state
            .compare_exchange(CREATED, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.complete(ProcessorState::Stopped);
        }
    }

    /// Block until the processor is finished or stopped, for at most `timeout`.
    ///
    /// Returns the last processed offset, or [`NOTHING_PROCESSED`] on timeout.
    pub fn wait_for_completion(&self, timeout: Duration) -> i64 {
        let mut done = self.done.lock();
        if !*done {
            self.done_signal
                .wait_while_for(&mut done, |done| !*done, timeout);
        }

        if *done {
            self.last_processed_offset()
        } else {
            NOTHING_PROCESSED
        }
    }

    fn complete(&self, final_state: ProcessorState) {
        let value = match final_state {
            ProcessorState::Finished => FINISHED,
            _ => STOPPED,
        };
        self.state.store(value, Ordering::Release);

        let mut done = self.done.lock();
        *done = true;
        self.done_signal.notify_all();
    }
}
