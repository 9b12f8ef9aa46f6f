//! Outbound records, delivery metadata and per-record send results.

use crate::types::{Timestamp, TopicPartition};
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single record header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header key
    pub key: String,
    /// Header value
    pub value: Bytes,
}

/// Record destined for a topic, with optional key and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord<K, V> {
    /// Destination topic
    pub topic: String,

    /// Explicit partition; the client partitions by key when unset
    pub partition: Option<i32>,

    /// Optional record key
    pub key: Option<K>,

    /// Record value; `None` is a tombstone
    pub value: Option<V>,

    /// Optional create time; the client stamps the record when unset
    pub timestamp: Option<Timestamp>,

    /// Record headers
    pub headers: Vec<Header>,
}

/// A record whose key and value have already been serialized.
pub type SerializedRecord = ProducerRecord<Bytes, Bytes>;

impl<K, V> ProducerRecord<K, V> {
    /// Create a record with a value and no key.
    #[must_use]
    pub fn new(topic: impl Into<String>, value: V) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: Some(value),
            timestamp: None,
            headers: Vec::new(),
        }
    }

    /// Create a tombstone for `key`.
    #[must_use]
    pub fn tombstone(topic: impl Into<String>, key: K) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: Some(key),
            value: None,
            timestamp: None,
            headers: Vec::new(),
        }
    }

    /// Set the record key.
    #[must_use]
    pub fn with_key(mut self, key: K) -> Self {
        self.key = Some(key);
        self
    }

    /// Pin the record to a partition.
    #[must_use]
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the record create time.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header { key: key.into(), value: value.into() });
        self
    }

    /// Get a header value by key; the last header with that key wins.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers.iter().rev().find(|h| h.key == key).map(|h| &h.value)
    }

    /// Replace key and value while keeping routing information and headers.
    pub fn map_payload<K2, V2>(
        self,
        key: Option<K2>,
        value: Option<V2>,
    ) -> ProducerRecord<K2, V2> {
        ProducerRecord {
            topic: self.topic,
            partition: self.partition,
            key,
            value,
            timestamp: self.timestamp,
            headers: self.headers,
        }
    }
}

impl SerializedRecord {
    /// Serialized key size, or -1 when there is no key.
    #[must_use]
    pub fn serialized_key_size(&self) -> i32 {
        self.key.as_ref().map_or(-1, |k| i32::try_from(k.len()).unwrap_or(i32::MAX))
    }

    /// Serialized value size, or -1 for a tombstone.
    #[must_use]
    pub fn serialized_value_size(&self) -> i32 {
        self.value.as_ref().map_or(-1, |v| i32::try_from(v.len()).unwrap_or(i32::MAX))
    }

    /// Estimated wire size of the record in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let mut size = self.topic.len();
        size += self.key.as_ref().map_or(0, Bytes::len);
        size += self.value.as_ref().map_or(0, Bytes::len);
        for header in &self.headers {
            size += header.key.len() + header.value.len();
        }
        size
    }
}

/// An outbound record paired with caller-supplied correlation metadata.
///
/// The correlation value is returned untouched in the matching
/// [`SenderResult`], so callers can match acknowledgements to inputs even
/// when the client reorders them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderRecord<K, V, T> {
    /// The record to publish
    pub record: ProducerRecord<K, V>,
    /// Correlation metadata echoed in the result
    pub correlation_metadata: T,
}

impl<K, V, T> SenderRecord<K, V, T> {
    /// Pair a record with its correlation metadata.
    #[must_use]
    pub const fn create(record: ProducerRecord<K, V>, correlation_metadata: T) -> Self {
        Self { record, correlation_metadata }
    }

    /// Destination topic of the wrapped record.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.record.topic
    }
}

/// Broker-assigned position of an acknowledged record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Topic the record was appended to
    pub topic: String,
    /// Partition the record was appended to
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Create or log-append time of the record
    pub timestamp: Timestamp,
    /// Serialized key size, -1 when absent
    pub serialized_key_size: i32,
    /// Serialized value size, -1 when absent
    pub serialized_value_size: i32,
}

impl RecordMetadata {
    /// The partition this record landed in.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Outcome of one dispatched record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderResult<T> {
    result: Result<RecordMetadata>,
    correlation_metadata: T,
}

impl<T> SenderResult<T> {
    /// Successful delivery.
    #[must_use]
    pub const fn success(metadata: RecordMetadata, correlation_metadata: T) -> Self {
        Self { result: Ok(metadata), correlation_metadata }
    }

    /// Failed delivery.
    #[must_use]
    pub const fn failure(error: Error, correlation_metadata: T) -> Self {
        Self { result: Err(error), correlation_metadata }
    }

    /// Build a result from a client acknowledgement.
    #[must_use]
    pub const fn from_result(result: Result<RecordMetadata>, correlation_metadata: T) -> Self {
        Self { result, correlation_metadata }
    }

    /// Delivery metadata when the send succeeded.
    #[must_use]
    pub fn record_metadata(&self) -> Option<&RecordMetadata> {
        self.result.as_ref().ok()
    }

    /// Failure cause when the send failed.
    #[must_use]
    pub fn exception(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    /// Correlation metadata of the originating record.
    #[must_use]
    pub const fn correlation_metadata(&self) -> &T {
        &self.correlation_metadata
    }

    /// Whether the record was acknowledged by the broker.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Split into the delivery outcome and the correlation metadata.
    pub fn into_parts(self) -> (Result<RecordMetadata>, T) {
        (self.result, self.correlation_metadata)
    }
}
