//! Partition-ordered Kafka request dispatcher.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message and hide the chain.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source. Avoid `anyhow!("...{e}")`, that formats the error into a string and drops the chain.

pub mod batch_processor;
pub mod broker;
pub mod commit_scheduler;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod kafka;
pub mod metrics_consts;
pub mod offset_ledger;
pub mod partition_gate;
pub mod partition_monitor;
pub mod rebalance_coordinator;
pub mod request;
pub mod server;
pub mod service;
pub mod test_utils;
pub mod types;
pub mod worker_pool;

// Re-export commonly used types for convenience
pub use broker::{BrokerClient, BrokerError, CommitMode, OffsetCommitter, RebalanceListener};
pub use dispatcher::{DispatchMode, Dispatcher, DispatcherSettings};
pub use request::{Authentication, RequestExecutor, RequestHandler, UnitOfWork};
pub use types::{Partition, Record, RecordBatch};
