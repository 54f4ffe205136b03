// ==== Poll loop ====
/// Counter for poll cycles executed by the dispatcher
pub const POLL_CYCLES: &str = "partition_dispatcher_poll_cycles_total";

/// Counter for failed broker polls, labelled by error kind
pub const POLL_ERRORS: &str = "partition_dispatcher_poll_errors_total";

/// Counter for records returned by broker polls
pub const RECORDS_POLLED: &str = "partition_dispatcher_records_polled_total";

/// Counter for idle sleeps taken by the dispatch loop
pub const IDLE_SLEEPS: &str = "partition_dispatcher_idle_sleeps_total";

// ==== Batch processing ====
/// Counter for batch processors started
pub const BATCHES_STARTED: &str = "partition_dispatcher_batches_started_total";

/// Counter for batches held back because their partition was still busy
pub const BATCHES_DEFERRED: &str = "partition_dispatcher_batches_deferred_total";

/// Histogram for wall-clock time spent executing a batch
pub const BATCH_DURATION: &str = "partition_dispatcher_batch_duration_seconds";

/// Counter for records handled, labelled by outcome
pub const RECORDS_PROCESSED: &str = "partition_dispatcher_records_processed_total";

/// Gauge for batch processors currently active
pub const ACTIVE_PROCESSORS: &str = "partition_dispatcher_active_processors";

// ==== Offsets ====
/// Counter for offset commits, labelled by mode and result
pub const OFFSET_COMMITS: &str = "partition_dispatcher_offset_commits_total";

/// Counter for ledger updates that would have moved an offset backwards
pub const LEDGER_STALE_OFFSET: &str = "partition_dispatcher_ledger_stale_offset_total";

// ==== Rebalance ====
/// Counter for partitions assigned to this consumer
pub const PARTITIONS_ASSIGNED: &str = "partition_dispatcher_partitions_assigned_total";

/// Counter for partitions revoked from this consumer
pub const PARTITIONS_REVOKED: &str = "partition_dispatcher_partitions_revoked_total";

/// Counter for revoke drains, labelled by result
pub const REVOKE_DRAINS: &str = "partition_dispatcher_revoke_drains_total";

/// Counter for rebalance callbacks skipped because the partition list was empty
pub const REBALANCE_EMPTY_SKIPPED: &str = "partition_dispatcher_rebalance_empty_skipped_total";

// ==== Flow control ====
/// Counter for pause/resume calls issued to the broker, labelled by action and scope
pub const FLOW_CONTROL_CALLS: &str = "partition_dispatcher_flow_control_calls_total";

// ==== Partition monitor gauges ====
/// Gauge for partitions currently paused
pub const MONITOR_PAUSED_PARTITIONS: &str = "partition_dispatcher_paused_partitions";

/// Gauge for the summed time all paused partitions have been paused (ms)
pub const MONITOR_PROCESSING_TIME_TOTAL: &str = "partition_dispatcher_processing_time_ms_total";

/// Gauge for the average time paused partitions have been paused (ms)
pub const MONITOR_PROCESSING_TIME_AVG: &str = "partition_dispatcher_processing_time_ms_avg";

/// Gauge for records still waiting in active batches
pub const MONITOR_TASKS_PENDING: &str = "partition_dispatcher_tasks_pending";

/// Gauge for records in active batches
pub const MONITOR_TASKS_TOTAL: &str = "partition_dispatcher_tasks_total";

// ==== Worker pool ====
/// Gauge for the configured worker pool size
pub const WORKER_POOL_SIZE: &str = "partition_dispatcher_worker_pool_size";

/// Gauge for work items queued or running on the pool
pub const WORKER_POOL_IN_FLIGHT: &str = "partition_dispatcher_worker_pool_in_flight";
