//! Fixed-size pool that runs batch processors on the tokio runtime.
//!
//! The dispatcher thread is not a runtime thread, so the pool holds a runtime
//! [`Handle`] and spawns onto it. At most `size` processors run at once: each task
//! holds a semaphore permit for the duration of one batch, and tasks waiting for a
//! permit stay in `Created` state, which lets a revoke stop them before they start.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::batch_processor::BatchProcessor;
use crate::metrics_consts::{WORKER_POOL_IN_FLIGHT, WORKER_POOL_SIZE};
use crate::request::RequestHandler;

pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    in_flight: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    /// Pool size for a topic with `partition_count` partitions. More workers than
    /// partitions would never be used by the ordered dispatcher.
    pub fn effective_size(configured: Option<usize>, partition_count: usize) -> usize {
        let requested = configured.unwrap_or_else(num_cpus::get).max(1);
        if partition_count == 0 {
            return requested;
        }
        if requested > partition_count {
            warn!(
                requested = requested,
                partition_count = partition_count,
                "Worker pool size exceeds partition count, capping it"
            );
            return partition_count;
        }
        requested
    }

    pub fn new(runtime: Handle, size: usize) -> Self {
        let size = size.max(1);
        metrics::gauge!(WORKER_POOL_SIZE).set(size as f64);
        info!(size = size, "Created worker pool");

        Self {
            runtime,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Processors queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Queue `processor` for execution. Never blocks the caller.
    pub fn submit(&self, processor: Arc<BatchProcessor>, handler: Arc<RequestHandler>) {
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();
        let queued = in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::gauge!(WORKER_POOL_IN_FLIGHT).set(queued as f64);

        self.tracker.spawn_on(
            async move {
                // the semaphore is never closed, so acquiring only waits
                if let Ok(_permit) = permits.acquire_owned().await {
                    processor.run(&handler).await;
                }
                let remaining = in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
                metrics::gauge!(WORKER_POOL_IN_FLIGHT).set(remaining as f64);
            },
            &self.runtime,
        );
    }

    /// Wait up to `timeout` for queued and running processors to finish.
    ///
    /// Blocks the calling thread, which must not be a runtime worker thread.
    /// Returns `false` if the wait timed out.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();

        let tracker = self.tracker.clone();
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, tracker.wait()).await })
            .is_ok()
    }
}
