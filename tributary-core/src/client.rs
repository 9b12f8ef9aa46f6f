//! Contract of the underlying producer client and the factory that builds it.
//!
//! The sender never constructs a client directly. It asks a
//! [`ProducerFactory`] for one, then drives it exclusively from a single
//! worker thread, which is why [`ProducerClient`] only requires `Send`.

use crate::record::{RecordMetadata, SerializedRecord};
use crate::types::TransactionOffsets;
use crate::Result;
use std::collections::BTreeMap;
use std::time::Duration;

/// Invoked exactly once with the acknowledgement of one record.
///
/// Clients typically call it from their own I/O threads.
pub type DeliveryCallback = Box<dyn FnOnce(Result<RecordMetadata>) + Send + 'static>;

/// Partition layout of a topic as reported by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Broker id of the current leader, if one is elected
    pub leader: Option<i32>,
}

/// A callback-driven broker producer.
///
/// Transactional calls block until the broker confirms them and must never
/// be issued concurrently; the sender guarantees this by calling every
/// method from one thread.
pub trait ProducerClient: Send + 'static {
    /// Hand a record to the client. Failures, including ones detected
    /// before the record leaves the process, are reported via `callback`.
    fn send(&mut self, record: SerializedRecord, callback: DeliveryCallback);

    /// Block until every record handed over so far is acknowledged.
    ///
    /// # Errors
    /// Returns [`crate::Error::Timeout`] if acknowledgements are still
    /// outstanding after `timeout`.
    fn flush(&mut self, timeout: Duration) -> Result<()>;

    /// Release client resources, waiting at most `timeout` for in-flight
    /// requests. A zero timeout closes forcibly.
    ///
    /// # Errors
    /// Returns an error if the client could not shut down cleanly.
    fn close(&mut self, timeout: Duration) -> Result<()>;

    /// Partition layout of `topic`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidTopic`] for unknown topics.
    fn partitions_for(&mut self, topic: &str) -> Result<Vec<PartitionInfo>>;

    /// Register the transactional id with the broker and fence older
    /// producers using it. Called once, before any other transactional call.
    ///
    /// # Errors
    /// Returns an error if the producer is not transactional or fencing fails.
    fn init_transactions(&mut self) -> Result<()>;

    /// Start a transaction.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the call.
    fn begin_transaction(&mut self) -> Result<()>;

    /// Make consumer offsets part of the current transaction.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the offsets.
    fn send_offsets_to_transaction(
        &mut self,
        offsets: &TransactionOffsets,
        consumer_group_id: &str,
    ) -> Result<()>;

    /// Commit the current transaction.
    ///
    /// # Errors
    /// Returns an error if the commit fails; the transaction must then be aborted.
    fn commit_transaction(&mut self) -> Result<()>;

    /// Abort the current transaction.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the abort.
    fn abort_transaction(&mut self) -> Result<()>;
}

/// Creates connected clients from client properties.
pub trait ProducerFactory: Send + Sync + 'static {
    /// Build a client for `properties`.
    ///
    /// # Errors
    /// Returns an error if the client cannot be created or connected.
    fn create_producer(
        &self,
        properties: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ProducerClient>>;
}

impl<F> ProducerFactory for F
where
    F: Fn(&BTreeMap<String, String>) -> Result<Box<dyn ProducerClient>> + Send + Sync + 'static,
{
    fn create_producer(
        &self,
        properties: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ProducerClient>> {
        self(properties)
    }
}
