use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, CommitMode, OffsetCommitter, RebalanceListener};
use crate::metrics_consts::REBALANCE_EMPTY_SKIPPED;
use crate::types::Partition;

/// Consumer context that hands rebalance events to a [`RebalanceListener`].
///
/// librdkafka calls `pre_rebalance`/`post_rebalance` from inside `poll`, on the thread
/// that drives the consumer. Revocations are forwarded before the assignment changes, so
/// the listener can drain and commit while the partitions are still owned.
pub struct DispatchConsumerContext {
    listener: Arc<dyn RebalanceListener>,
    /// Set once the client has revoked its assignment itself during close
    closing: AtomicBool,
    /// Partitions revoked since the client last looked
    revoked: Mutex<Vec<Partition>>,
}

impl DispatchConsumerContext {
    pub fn new(listener: Arc<dyn RebalanceListener>) -> Self {
        Self {
            listener,
            closing: AtomicBool::new(false),
            revoked: Mutex::new(Vec::new()),
        }
    }

    pub fn listener(&self) -> &Arc<dyn RebalanceListener> {
        &self.listener
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn record_revoked(&self, partitions: &[Partition]) {
        self.revoked.lock().extend_from_slice(partitions);
    }

    /// Partitions revoked since the last call.
    pub(crate) fn take_revoked(&self) -> Vec<Partition> {
        std::mem::take(&mut *self.revoked.lock())
    }
}

impl ClientContext for DispatchConsumerContext {}

impl ConsumerContext for DispatchConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends empty revokes whenever group membership changes
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke")
                        .increment(1);
                    return;
                }
                if self.closing.load(Ordering::SeqCst) {
                    debug!("Consumer closing, revoke already handled");
                    return;
                }

                let partitions = to_partitions(partitions);
                let committer = CallbackCommitter::new(base_consumer);
                self.listener.on_partitions_revoked(&partitions, &committer);
                self.record_revoked(&partitions);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign")
                        .increment(1);
                    return;
                }
                self.listener
                    .on_partitions_assigned(&to_partitions(partitions));
            }
            Rebalance::Revoke(partitions) => {
                info!("Post-rebalance revoke of {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

/// Commits through the consumer handed to a rebalance callback.
pub struct CallbackCommitter<'a, C: ConsumerContext> {
    consumer: &'a BaseConsumer<C>,
}

impl<'a, C: ConsumerContext> CallbackCommitter<'a, C> {
    pub fn new(consumer: &'a BaseConsumer<C>) -> Self {
        Self { consumer }
    }
}

impl<C: ConsumerContext> OffsetCommitter for CallbackCommitter<'_, C> {
    fn commit(
        &self,
        offsets: &HashMap<Partition, i64>,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        commit_offsets(self.consumer, offsets, mode)
    }
}

pub(crate) fn commit_offsets<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    offsets: &HashMap<Partition, i64>,
    mode: CommitMode,
) -> Result<(), BrokerError> {
    if offsets.is_empty() {
        return Ok(());
    }
    let list = offsets_to_tpl(offsets)?;
    let mode = match mode {
        CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
        CommitMode::Async => rdkafka::consumer::CommitMode::Async,
    };
    consumer.commit(&list, mode)?;
    Ok(())
}

pub(crate) fn offsets_to_tpl(
    offsets: &HashMap<Partition, i64>,
) -> Result<TopicPartitionList, KafkaError> {
    let mut list = TopicPartitionList::new();
    for (partition, next_offset) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*next_offset),
        )?;
    }
    Ok(list)
}

pub(crate) fn partitions_to_tpl(partitions: &[Partition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for partition in partitions {
        list.add_partition(partition.topic(), partition.partition_number());
    }
    list
}

pub(crate) fn to_partitions(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}
