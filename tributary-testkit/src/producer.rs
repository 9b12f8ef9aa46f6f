//! Mock producer client backed by a [`MockCluster`].
//!
//! Records are acknowledged from a separate executor thread after the
//! configured send delay, so acknowledgements arrive asynchronously the way
//! they do from a real client. Tests can hang acknowledgements, fail the next
//! commit, and read call counters.

use crate::cluster::MockCluster;
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use tributary_core::config::TRANSACTIONAL_ID_CONFIG;
use tributary_core::{
    DeliveryCallback, Error, PartitionInfo, ProducerClient, RecordMetadata, Result,
    SerializedRecord, TopicPartition, TransactionOffsets,
};

type Job = Box<dyn FnOnce() + Send>;

/// How long commit and abort wait for in-flight deliveries.
const TRANSACTION_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Call counters of a [`MockProducer`].
#[derive(Debug, Default)]
pub struct ProducerCounters {
    /// Records handed to `send`
    pub sends: AtomicUsize,
    /// Records sent and not yet acknowledged
    pub in_flight: AtomicUsize,
    /// Highest `in_flight` value seen
    pub max_in_flight: AtomicUsize,
    /// `init_transactions` calls
    pub inits: AtomicUsize,
    /// `begin_transaction` calls
    pub begins: AtomicUsize,
    /// Successful `commit_transaction` calls
    pub commits: AtomicUsize,
    /// `abort_transaction` calls
    pub aborts: AtomicUsize,
    /// `send_offsets_to_transaction` calls
    pub send_offsets: AtomicUsize,
    /// `flush` calls
    pub flushes: AtomicUsize,
    /// `close` calls
    pub closes: AtomicUsize,
}

#[derive(Default)]
struct OpenTransaction {
    written: Vec<(TopicPartition, i64)>,
    offsets: Vec<(String, TransactionOffsets)>,
}

struct ProducerState {
    cluster: MockCluster,
    counters: ProducerCounters,
    transactional: AtomicBool,
    closed: AtomicBool,
    send_delay: Mutex<Duration>,
    hang_acks: AtomicBool,
    hung: Mutex<Vec<(SerializedRecord, DeliveryCallback)>>,
    fail_next_commit: Mutex<Option<Error>>,
    transaction: Mutex<OpenTransaction>,
    idle: Mutex<()>,
    idle_signal: Condvar,
}

impl ProducerState {
    fn deliver(&self, record: SerializedRecord, callback: DeliveryCallback) {
        if self.hang_acks.load(Ordering::Acquire) {
            self.hung.lock().push((record, callback));
            return;
        }
        let result = self.append(&record);
        {
            let _idle = self.idle.lock();
            self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.idle_signal.notify_all();
        }
        callback(result);
    }

    fn append(&self, record: &SerializedRecord) -> Result<RecordMetadata> {
        let transactional = self.transactional.load(Ordering::Acquire);
        let stored = self.cluster.append(record, !transactional)?;
        if transactional {
            self.transaction.lock().written.push((stored.topic_partition.clone(), stored.offset));
        }
        Ok(RecordMetadata {
            topic: stored.topic_partition.topic().to_string(),
            partition: stored.topic_partition.partition(),
            offset: stored.offset,
            timestamp: stored.timestamp,
            serialized_key_size: record.serialized_key_size(),
            serialized_value_size: record.serialized_value_size(),
        })
    }

    /// Wait until every record handed to `send` has been appended.
    fn await_deliveries(&self, timeout: Duration, operation: &str) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut idle = self.idle.lock();
        while self.counters.in_flight.load(Ordering::Acquire) > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle_signal.wait_until(&mut idle, deadline).timed_out() {
                        return Err(Error::timeout(operation));
                    }
                },
                None => self.idle_signal.wait(&mut idle),
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::illegal_state("MockProducer is already closed"))
        } else {
            Ok(())
        }
    }

    fn ensure_transactional(&self) -> Result<()> {
        self.ensure_open()?;
        if self.transactional.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::illegal_state("MockProducer is not transactional"))
        }
    }
}

/// Single-threaded executor that runs acknowledgement jobs in order.
struct Executor {
    jobs: Mutex<Option<Sender<(Instant, Job)>>>,
}

impl Executor {
    fn start() -> Self {
        let (jobs, queue) = channel::unbounded::<(Instant, Job)>();
        let spawned = thread::Builder::new().name("mock-producer-executor".to_string()).spawn(
            move || {
                while let Ok((due, job)) = queue.recv() {
                    let now = Instant::now();
                    if due > now {
                        thread::sleep(due - now);
                    }
                    job();
                }
            },
        );
        if let Err(e) = spawned {
            debug!(error = %e, "Failed to start mock executor; jobs will run inline");
            return Self { jobs: Mutex::new(None) };
        }
        Self { jobs: Mutex::new(Some(jobs)) }
    }

    fn submit(&self, due: Instant, job: Job) {
        let rejected = match self.jobs.lock().as_ref() {
            Some(jobs) => jobs.send((due, job)).err().map(|e| e.into_inner().1),
            None => Some(job),
        };
        if let Some(job) = rejected {
            job();
        }
    }

    fn shutdown(&self) {
        self.jobs.lock().take();
    }
}

/// Mock producer client. Clones share state, so a test can keep a clone
/// while the sender owns another.
#[derive(Clone)]
pub struct MockProducer {
    state: Arc<ProducerState>,
    executor: Arc<Executor>,
}

impl MockProducer {
    /// A non-transactional producer writing to `cluster`.
    #[must_use]
    pub fn new(cluster: MockCluster) -> Self {
        Self {
            state: Arc::new(ProducerState {
                cluster,
                counters: ProducerCounters::default(),
                transactional: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                send_delay: Mutex::new(Duration::ZERO),
                hang_acks: AtomicBool::new(false),
                hung: Mutex::new(Vec::new()),
                fail_next_commit: Mutex::new(None),
                transaction: Mutex::new(OpenTransaction::default()),
                idle: Mutex::new(()),
                idle_signal: Condvar::new(),
            }),
            executor: Arc::new(Executor::start()),
        }
    }

    /// Apply client properties; a non-empty transactional id makes the
    /// producer transactional.
    pub fn configure(&self, properties: &BTreeMap<String, String>) {
        let transactional =
            properties.get(TRANSACTIONAL_ID_CONFIG).is_some_and(|id| !id.is_empty());
        self.state.transactional.store(transactional, Ordering::Release);
    }

    /// Delay every acknowledgement by `delay`.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.state.send_delay.lock() = delay;
    }

    /// Hold back acknowledgements until [`MockProducer::release_hung`].
    pub fn hang_acks(&self) {
        self.state.hang_acks.store(true, Ordering::Release);
    }

    /// Stop hanging and acknowledge every held record, in order.
    pub fn release_hung(&self) {
        self.state.hang_acks.store(false, Ordering::Release);
        let hung = std::mem::take(&mut *self.state.hung.lock());
        for (record, callback) in hung {
            self.state.deliver(record, callback);
        }
    }

    /// Records whose acknowledgement is being held back.
    #[must_use]
    pub fn hung_count(&self) -> usize {
        self.state.hung.lock().len()
    }

    /// Fail the next `commit_transaction` with `error`.
    pub fn fail_next_commit(&self, error: Error) {
        *self.state.fail_next_commit.lock() = Some(error);
    }

    /// Call counters.
    #[must_use]
    pub fn counters(&self) -> &ProducerCounters {
        &self.state.counters
    }

    /// Records handed to `send`.
    #[must_use]
    pub fn send_count(&self) -> usize {
        self.state.counters.sends.load(Ordering::Acquire)
    }

    /// Highest number of unacknowledged records observed.
    #[must_use]
    pub fn max_in_flight_observed(&self) -> usize {
        self.state.counters.max_in_flight.load(Ordering::Acquire)
    }

    /// Whether the producer runs in transactional mode.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.state.transactional.load(Ordering::Acquire)
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// The cluster this producer writes to.
    #[must_use]
    pub fn cluster(&self) -> &MockCluster {
        &self.state.cluster
    }
}

impl ProducerClient for MockProducer {
    fn send(&mut self, record: SerializedRecord, callback: DeliveryCallback) {
        let counters = &self.state.counters;
        counters.sends.fetch_add(1, Ordering::AcqRel);
        let in_flight = counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        counters.max_in_flight.fetch_max(in_flight, Ordering::AcqRel);

        if let Err(e) = self.state.ensure_open() {
            counters.in_flight.fetch_sub(1, Ordering::AcqRel);
            callback(Err(e));
            return;
        }

        let due = Instant::now() + *self.state.send_delay.lock();
        let state = Arc::clone(&self.state);
        self.executor.submit(due, Box::new(move || state.deliver(record, callback)));
    }

    fn flush(&mut self, timeout: Duration) -> Result<()> {
        self.state.counters.flushes.fetch_add(1, Ordering::AcqRel);
        self.state.await_deliveries(timeout, "flush")
    }

    fn close(&mut self, _timeout: Duration) -> Result<()> {
        self.state.counters.closes.fetch_add(1, Ordering::AcqRel);
        self.state.closed.store(true, Ordering::Release);
        self.executor.shutdown();
        Ok(())
    }

    fn partitions_for(&mut self, topic: &str) -> Result<Vec<PartitionInfo>> {
        self.state.cluster.partitions_for(topic)
    }

    fn init_transactions(&mut self) -> Result<()> {
        self.state.ensure_transactional()?;
        self.state.counters.inits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<()> {
        self.state.ensure_transactional()?;
        self.state.counters.begins.fetch_add(1, Ordering::AcqRel);
        *self.state.transaction.lock() = OpenTransaction::default();
        Ok(())
    }

    fn send_offsets_to_transaction(
        &mut self,
        offsets: &TransactionOffsets,
        consumer_group_id: &str,
    ) -> Result<()> {
        self.state.ensure_transactional()?;
        self.state.counters.send_offsets.fetch_add(1, Ordering::AcqRel);
        self.state
            .transaction
            .lock()
            .offsets
            .push((consumer_group_id.to_string(), offsets.clone()));
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.state.ensure_transactional()?;
        if let Some(error) = self.state.fail_next_commit.lock().take() {
            return Err(error);
        }
        self.state.await_deliveries(TRANSACTION_COMPLETION_TIMEOUT, "commit")?;
        self.state.counters.commits.fetch_add(1, Ordering::AcqRel);
        let transaction = std::mem::take(&mut *self.state.transaction.lock());
        self.state.cluster.complete_transaction(&transaction.written, true);
        for (group_id, offsets) in &transaction.offsets {
            self.state.cluster.commit_offsets(group_id, offsets);
        }
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<()> {
        self.state.ensure_transactional()?;
        self.state.counters.aborts.fetch_add(1, Ordering::AcqRel);
        self.state.await_deliveries(TRANSACTION_COMPLETION_TIMEOUT, "abort")?;
        let transaction = std::mem::take(&mut *self.state.transaction.lock());
        self.state.cluster.complete_transaction(&transaction.written, false);
        Ok(())
    }
}

impl std::fmt::Debug for MockProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProducer")
            .field("transactional", &self.is_transactional())
            .field("closed", &self.is_closed())
            .field("counters", &self.state.counters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::mpsc;

    fn record() -> SerializedRecord {
        SerializedRecord::new("t", Bytes::from_static(b"v"))
    }

    fn send(producer: &mut MockProducer) -> mpsc::Receiver<Result<RecordMetadata>> {
        let (tx, rx) = mpsc::channel();
        producer.send(
            record(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx
    }

    #[test]
    fn test_acknowledges_asynchronously() {
        let mut producer = MockProducer::new(MockCluster::new().with_topic("t", 1));
        let ack = send(&mut producer).recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ack.unwrap().offset, 0);
        assert_eq!(producer.send_count(), 1);
        assert!(producer.flush(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_unknown_topic_fails_in_callback() {
        let mut producer = MockProducer::new(MockCluster::new());
        let ack = send(&mut producer).recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(ack, Err(Error::InvalidTopic { .. })));
    }

    #[test]
    fn test_hung_acks_block_flush_until_released() {
        let mut producer = MockProducer::new(MockCluster::new().with_topic("t", 1));
        producer.hang_acks();
        let ack = send(&mut producer);
        assert!(ack.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(matches!(producer.flush(Duration::from_millis(20)), Err(Error::Timeout { .. })));

        producer.release_hung();
        assert!(ack.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        assert!(producer.flush(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_transactions_require_transactional_config() {
        let mut producer = MockProducer::new(MockCluster::new());
        assert!(producer.init_transactions().unwrap_err().is_illegal_state());

        let properties =
            BTreeMap::from([(TRANSACTIONAL_ID_CONFIG.to_string(), "tx".to_string())]);
        producer.configure(&properties);
        assert!(producer.init_transactions().is_ok());
        assert!(producer.begin_transaction().is_ok());
        assert!(producer.abort_transaction().is_ok());
        assert_eq!(producer.counters().aborts.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_commit_waits_for_in_flight_deliveries() {
        let cluster = MockCluster::new().with_topic("t", 1);
        let mut producer = MockProducer::new(cluster.clone());
        producer.configure(&BTreeMap::from([(
            TRANSACTIONAL_ID_CONFIG.to_string(),
            "tx".to_string(),
        )]));
        producer.set_send_delay(Duration::from_millis(50));
        producer.begin_transaction().unwrap();

        let ack = send(&mut producer);
        producer.commit_transaction().unwrap();
        assert!(ack.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        assert_eq!(cluster.committed_records("t").len(), 1);
    }

    #[test]
    fn test_send_after_close_fails() {
        let mut producer = MockProducer::new(MockCluster::new().with_topic("t", 1));
        producer.close(Duration::ZERO).unwrap();
        let ack = send(&mut producer).recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(ack.unwrap_err().is_illegal_state());
        assert!(producer.is_closed());
    }
}
