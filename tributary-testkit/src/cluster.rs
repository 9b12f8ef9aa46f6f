//! In-memory broker cluster.

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;
use tributary_core::{
    Error, PartitionInfo, Result, SerializedRecord, Timestamp, TopicPartition, TransactionOffsets,
};

/// Visibility of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Visible to read-committed consumers
    Committed,
    /// Written inside a transaction that has not completed yet
    Pending,
    /// Written inside a transaction that was aborted
    Aborted,
}

/// A record appended to a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Partition the record lives in
    pub topic_partition: TopicPartition,
    /// Offset within the partition
    pub offset: i64,
    /// Serialized key
    pub key: Option<Bytes>,
    /// Serialized value
    pub value: Option<Bytes>,
    /// Create time, or append time when the record carried none
    pub timestamp: Timestamp,
    /// Transactional visibility
    pub status: RecordStatus,
}

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<StoredRecord>,
    leader_available: bool,
}

#[derive(Debug, Default)]
struct ClusterInner {
    topics: DashMap<String, i32>,
    partitions: DashMap<TopicPartition, PartitionLog>,
    group_offsets: DashMap<(String, TopicPartition), i64>,
    authentication_failed: AtomicBool,
    round_robin: AtomicUsize,
    append_lock: Mutex<()>,
}

/// In-memory cluster shared by mock producers. Cloning yields another
/// reference to the same cluster.
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    inner: Arc<ClusterInner>,
}

impl MockCluster {
    /// An empty cluster with no topics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `topic` with `partitions` partitions, all with an available leader.
    #[must_use]
    pub fn with_topic(self, topic: &str, partitions: i32) -> Self {
        self.add_topic(topic, partitions);
        self
    }

    /// Add `topic` with `partitions` partitions, all with an available leader.
    pub fn add_topic(&self, topic: &str, partitions: i32) {
        self.inner.topics.insert(topic.to_string(), partitions);
        for partition in 0..partitions {
            self.inner.partitions.insert(
                TopicPartition::new(topic, partition),
                PartitionLog { records: Vec::new(), leader_available: true },
            );
        }
    }

    /// Partition layout of `topic`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTopic`] if the topic does not exist.
    pub fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionInfo>> {
        let count = self.partition_count(topic)?;
        Ok((0..count)
            .map(|partition| PartitionInfo {
                topic: topic.to_string(),
                partition,
                leader: self.leader_available(&TopicPartition::new(topic, partition)).then_some(0),
            })
            .collect())
    }

    fn partition_count(&self, topic: &str) -> Result<i32> {
        self.inner
            .topics
            .get(topic)
            .map(|count| *count)
            .ok_or_else(|| Error::InvalidTopic { topic: topic.to_string() })
    }

    /// Make the leader of `topic_partition` unavailable.
    pub fn fail_leader(&self, topic_partition: &TopicPartition) {
        if let Some(mut log) = self.inner.partitions.get_mut(topic_partition) {
            log.leader_available = false;
        }
    }

    /// Restore the leader of `topic_partition`.
    pub fn restore_leader(&self, topic_partition: &TopicPartition) {
        if let Some(mut log) = self.inner.partitions.get_mut(topic_partition) {
            log.leader_available = true;
        }
    }

    /// Whether `topic_partition` exists and has a leader.
    #[must_use]
    pub fn leader_available(&self, topic_partition: &TopicPartition) -> bool {
        self.inner.partitions.get(topic_partition).is_some_and(|log| log.leader_available)
    }

    /// Reject every subsequent append with [`Error::Authentication`].
    pub fn fail_authentication(&self, failed: bool) {
        self.inner.authentication_failed.store(failed, Ordering::Release);
    }

    /// Append `record`, choosing a partition the way a client partitioner
    /// would: the explicit partition, else a key hash, else round-robin.
    ///
    /// # Errors
    /// Returns [`Error::Authentication`] while authentication failure is
    /// injected, [`Error::InvalidTopic`] for unknown topics or partitions and
    /// [`Error::LeaderNotAvailable`] while the partition leader is down.
    pub fn append(&self, record: &SerializedRecord, committed: bool) -> Result<StoredRecord> {
        if self.inner.authentication_failed.load(Ordering::Acquire) {
            return Err(Error::Authentication { message: "SASL authentication failed".to_string() });
        }
        let partition = self.choose_partition(record)?;
        let topic_partition = TopicPartition::new(record.topic.clone(), partition);

        let _guard = self.inner.append_lock.lock();
        let mut log = self
            .inner
            .partitions
            .get_mut(&topic_partition)
            .ok_or_else(|| Error::InvalidTopic { topic: topic_partition.to_string() })?;
        if !log.leader_available {
            return Err(Error::LeaderNotAvailable { topic: record.topic.clone(), partition });
        }

        let stored = StoredRecord {
            topic_partition: topic_partition.clone(),
            offset: i64::try_from(log.records.len()).unwrap_or(i64::MAX),
            key: record.key.clone(),
            value: record.value.clone(),
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
            status: if committed { RecordStatus::Committed } else { RecordStatus::Pending },
        };
        log.records.push(stored.clone());
        trace!(partition = %topic_partition, offset = stored.offset, "Appended record");
        Ok(stored)
    }

    fn choose_partition(&self, record: &SerializedRecord) -> Result<i32> {
        let count = self.partition_count(&record.topic)?;
        if let Some(partition) = record.partition {
            return Ok(partition);
        }
        let slot = match &record.key {
            Some(key) => key.iter().fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(*b))),
            None => self.inner.round_robin.fetch_add(1, Ordering::Relaxed),
        };
        let count = usize::try_from(count.max(1)).unwrap_or(1);
        Ok(i32::try_from(slot % count).unwrap_or(0))
    }

    /// Mark pending records as committed or aborted.
    pub fn complete_transaction(&self, written: &[(TopicPartition, i64)], commit: bool) {
        let status = if commit { RecordStatus::Committed } else { RecordStatus::Aborted };
        for (topic_partition, offset) in written {
            if let Some(mut log) = self.inner.partitions.get_mut(topic_partition) {
                let index = usize::try_from(*offset).unwrap_or(usize::MAX);
                if let Some(record) = log.records.get_mut(index) {
                    record.status = status;
                }
            }
        }
    }

    /// Store consumer group offsets.
    pub fn commit_offsets(&self, group_id: &str, offsets: &TransactionOffsets) {
        for (topic_partition, offset) in offsets {
            self.inner
                .group_offsets
                .insert((group_id.to_string(), topic_partition.clone()), offset.offset.value());
        }
    }

    /// Committed offset of `group_id` for `topic_partition`.
    #[must_use]
    pub fn committed_offset(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.inner
            .group_offsets
            .get(&(group_id.to_string(), topic_partition.clone()))
            .map(|offset| *offset)
    }

    /// Every record of `topic` with the given status, ordered by partition
    /// then offset.
    #[must_use]
    pub fn records_with_status(&self, topic: &str, status: RecordStatus) -> Vec<StoredRecord> {
        let mut records: Vec<StoredRecord> = self
            .inner
            .partitions
            .iter()
            .filter(|entry| entry.key().topic() == topic)
            .flat_map(|entry| entry.value().records.clone())
            .filter(|record| record.status == status)
            .collect();
        records.sort_by(|a, b| {
            (a.topic_partition.partition(), a.offset).cmp(&(b.topic_partition.partition(), b.offset))
        });
        records
    }

    /// Records of `topic` visible to read-committed consumers.
    #[must_use]
    pub fn committed_records(&self, topic: &str) -> Vec<StoredRecord> {
        self.records_with_status(topic, RecordStatus::Committed)
    }

    /// Record counts per partition of `topic`, including uncommitted ones.
    #[must_use]
    pub fn log_sizes(&self, topic: &str) -> HashMap<i32, usize> {
        self.inner
            .partitions
            .iter()
            .filter(|entry| entry.key().topic() == topic)
            .map(|entry| (entry.key().partition(), entry.value().records.len()))
            .collect()
    }
}
