use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, DefaultConsumerContext};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use super::context::{commit_offsets, partitions_to_tpl, to_partitions, CallbackCommitter};
use super::DispatchConsumerContext;
use crate::broker::{BrokerClient, BrokerError, CommitMode, OffsetCommitter, RebalanceListener};
use crate::types::{Partition, Record, RecordBatch};

/// [`BrokerClient`] over an rdkafka [`BaseConsumer`].
///
/// `BaseConsumer` is driven by explicit `poll` calls, and rebalance callbacks run inside
/// them, which is what the dispatcher's synchronous revoke hand-off needs.
pub struct KafkaBrokerClient {
    consumer: BaseConsumer<DispatchConsumerContext>,
    max_poll_records: usize,
    closed: bool,
}

impl KafkaBrokerClient {
    pub fn new(
        config: &ClientConfig,
        topic: &str,
        max_poll_records: usize,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<Self, BrokerError> {
        let context = DispatchConsumerContext::new(listener);
        let consumer: BaseConsumer<DispatchConsumerContext> = config.create_with_context(context)?;
        consumer.subscribe(&[topic])?;

        info!(
            topic = topic,
            max_poll_records = max_poll_records,
            "Subscribed to topic"
        );

        Ok(Self {
            consumer,
            max_poll_records: max_poll_records.max(1),
            closed: false,
        })
    }

    /// Number of partitions of `topic`, from broker metadata.
    pub fn topic_partition_count(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<usize, BrokerError> {
        partition_count(&self.consumer, topic, timeout)
    }

    fn receive(&self, timeout: Duration) -> Option<Result<(Partition, Record), KafkaError>> {
        match self.consumer.poll(timeout)? {
            Ok(message) => {
                let partition = Partition::new(message.topic().to_string(), message.partition());
                let record = Record::new(
                    message.offset(),
                    message.key().map(<[u8]>::to_vec),
                    message.payload().map(<[u8]>::to_vec),
                );
                Some(Ok((partition, record)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Fetch the partition count of `topic` with a short-lived consumer that never joins
/// the group. Used to size the worker pool before the dispatcher connects.
pub fn fetch_partition_count(
    config: &ClientConfig,
    topic: &str,
    timeout: Duration,
) -> Result<usize, BrokerError> {
    let consumer: BaseConsumer<DefaultConsumerContext> = config.create()?;
    partition_count(&consumer, topic, timeout)
}

fn partition_count<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    topic: &str,
    timeout: Duration,
) -> Result<usize, BrokerError> {
    let metadata = consumer.fetch_metadata(Some(topic), timeout)?;
    metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .map(|t| t.partitions().len())
        .filter(|count| *count > 0)
        .ok_or_else(|| BrokerError::Unavailable(format!("no metadata for topic {topic}")))
}

/// Remove entries of `revoked` partitions, returning how many were removed.
fn discard_partitions(received: &mut Vec<(Partition, Record)>, revoked: &[Partition]) -> usize {
    if revoked.is_empty() {
        return 0;
    }
    let before = received.len();
    received.retain(|(partition, _)| !revoked.contains(partition));
    before - received.len()
}

fn is_partition_eof(e: &KafkaError) -> bool {
    matches!(
        e,
        KafkaError::PartitionEOF(_)
            | KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF)
    )
}

impl OffsetCommitter for KafkaBrokerClient {
    fn commit(
        &self,
        offsets: &HashMap<Partition, i64>,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        commit_offsets(&self.consumer, offsets, mode)
    }
}

impl BrokerClient for KafkaBrokerClient {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<RecordBatch>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let mut received = Vec::new();
        let mut wait = timeout;
        // revokes delivered outside poll, on close, need no filtering
        self.consumer.context().take_revoked();

        while received.len() < self.max_poll_records {
            let next = self.receive(wait);

            // a revoke inside this receive invalidates what was received before it
            let revoked = self.consumer.context().take_revoked();
            let discarded = discard_partitions(&mut received, &revoked);
            if discarded > 0 {
                warn!(
                    discarded = discarded,
                    revoked = revoked.len(),
                    "Discarding records of partitions revoked during poll"
                );
            }

            match next {
                None => break,
                Some(Ok(entry)) => received.push(entry),
                Some(Err(e)) if is_partition_eof(&e) => {}
                Some(Err(e)) => {
                    if received.is_empty() {
                        return Err(e.into());
                    }
                    warn!(
                        error = ?e,
                        "Kafka error after partial poll, returning what was received"
                    );
                    break;
                }
            }
            // only the first receive waits; the rest drain what is already fetched
            wait = Duration::ZERO;
        }

        Ok(RecordBatch::group_by_partition(received))
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer.pause(&partitions_to_tpl(partitions))?;
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer.resume(&partitions_to_tpl(partitions))?;
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, BrokerError> {
        Ok(to_partitions(&self.consumer.assignment()?))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }

        match self.assignment() {
            Ok(assigned) if !assigned.is_empty() => {
                info!(
                    count = assigned.len(),
                    "Revoking assignment before leaving the group"
                );
                let committer = CallbackCommitter::new(&self.consumer);
                self.consumer
                    .context()
                    .listener()
                    .on_partitions_revoked(&assigned, &committer);
            }
            Ok(_) => {}
            Err(e) => warn!(error = ?e, "Failed to read assignment on close"),
        }

        self.consumer.context().mark_closing();
        self.consumer.unsubscribe();
        self.closed = true;
        debug!("Kafka consumer unsubscribed");
    }
}
