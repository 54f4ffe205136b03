use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// A single offset-addressed entry read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

impl Record {
    pub fn new(offset: i64, key: Option<Vec<u8>>, payload: Option<Vec<u8>>) -> Self {
        Self {
            offset,
            key,
            payload,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// Records of exactly one partition returned by a single poll, in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    partition: Partition,
    records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(partition: Partition, records: Vec<Record>) -> Self {
        Self { partition, records }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(Record::offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(Record::offset)
    }

    /// Append the records of a later batch for the same partition.
    pub fn extend(&mut self, later: RecordBatch) {
        debug_assert_eq!(self.partition, later.partition);
        self.records.extend(later.records);
    }

    /// Split into one single-record batch per record.
    pub fn into_single_records(self) -> Vec<RecordBatch> {
        let partition = self.partition;
        self.records
            .into_iter()
            .map(|record| RecordBatch::new(partition.clone(), vec![record]))
            .collect()
    }

    /// Group polled records by partition, keeping first-seen partition order
    /// and the arrival order of records within each partition.
    pub fn group_by_partition(records: Vec<(Partition, Record)>) -> Vec<RecordBatch> {
        let mut batches: Vec<RecordBatch> = Vec::new();
        for (partition, record) in records {
            match batches.iter_mut().find(|b| b.partition == partition) {
                Some(batch) => batch.records.push(record),
                None => batches.push(RecordBatch::new(partition, vec![record])),
            }
        }
        batches
    }
}
