//! The seam between the dispatcher and the log broker.
//!
//! The dispatcher only ever talks to a [`BrokerClient`]. Rebalance notifications flow the
//! other way, through a [`RebalanceListener`] that the client receives when it is built and
//! invokes from inside `poll` (or `close`) before any membership change takes effect. The
//! listener is handed an [`OffsetCommitter`] so it can flush drained offsets while the
//! partitions are still owned.

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::types::{Partition, RecordBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Sync,
    Async,
}

impl CommitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitMode::Sync => "sync",
            CommitMode::Async => "async",
        }
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("broker client is closed")]
    Closed,

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

impl BrokerError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Kafka(e) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::AllBrokersDown) => "all_brokers_down",
                Some(RDKafkaErrorCode::BrokerTransportFailure) => "broker_transport",
                Some(RDKafkaErrorCode::OperationTimedOut) => "op_timed_out",
                Some(RDKafkaErrorCode::OffsetOutOfRange) => "offset_out_of_range",
                Some(RDKafkaErrorCode::Authentication) => "authentication",
                _ => "kafka",
            },
            BrokerError::Closed => "closed",
            BrokerError::Unavailable(_) => "unavailable",
        }
    }
}

/// Commits offsets to the broker. `offsets` holds the next offset to consume per partition.
pub trait OffsetCommitter {
    fn commit(
        &self,
        offsets: &HashMap<Partition, i64>,
        mode: CommitMode,
    ) -> Result<(), BrokerError>;
}

/// Receives partition ownership changes from a [`BrokerClient`].
///
/// Both callbacks run synchronously on the thread that drives the client. A revoke must
/// not return until in-flight work for the partitions has been drained (or the drain has
/// timed out) and the resulting offsets committed through `committer`.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&self, partitions: &[Partition], committer: &dyn OffsetCommitter);

    fn on_partitions_assigned(&self, partitions: &[Partition]);
}

/// A consumer-group client for a partitioned log.
///
/// Every method is called from the dispatcher thread only.
pub trait BrokerClient: OffsetCommitter + Send {
    /// Wait up to `timeout` for records, returning at most one batch per partition.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<RecordBatch>, BrokerError>;

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), BrokerError>;

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), BrokerError>;

    /// Partitions currently owned by this consumer.
    fn assignment(&self) -> Result<Vec<Partition>, BrokerError>;

    /// Abort a blocked poll. Clients whose poll wait is already bounded can ignore this.
    fn wake_up(&self) {}

    /// Leave the group. Owned partitions are revoked through the listener first.
    fn close(&mut self);
}
