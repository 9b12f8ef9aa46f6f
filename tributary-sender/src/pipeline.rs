//! Send pipeline.
//!
//! A pipeline pulls records from a caller's stream, serializes them and hands
//! them to the producer worker, keeping at most `max_in_flight` records
//! between dispatch and delivery to the caller. Each record holds one
//! semaphore permit from the moment it is pulled until its result is taken
//! from [`SendResults`], so a slow consumer of results also throttles the
//! upstream stream.

use crate::handle::{Completion, ProducerHandle};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};
use tributary_core::config::FatalPredicate;
use tributary_core::{
    Error, ProducerRecord, RecordMetadata, Result, SenderOptions, SenderRecord, SenderResult,
    SerializedRecord, Serializer,
};

/// Lifecycle of one send pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PipelineState {
    /// Created, driver not yet running
    Idle = 0,
    /// Pulling and dispatching records
    Running = 1,
    /// No longer pulling; in-flight results are still being delivered
    Draining = 2,
    /// The result stream has completed
    Terminated = 3,
}

impl PipelineState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

/// Counters and stop signal shared by the driver, the completions and the
/// result stream of one pipeline.
struct PipelineShared {
    stop_on_error: bool,
    fatal_predicate: FatalPredicate,
    stop: watch::Sender<bool>,
    error: Mutex<Option<Error>>,
    state: AtomicU8,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl PipelineShared {
    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop pulling and dispatching. The first error recorded becomes the
    /// terminal error of the result stream.
    fn stop(&self, error: Option<Error>) {
        if let Some(error) = error {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.stop.send_replace(true);
    }

    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn advance(&self, state: PipelineState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }
}

struct Delivered<T> {
    result: SenderResult<T>,
    _permit: OwnedSemaphorePermit,
}

/// One dispatched record awaiting its acknowledgement.
struct PendingSend<T> {
    correlation_metadata: T,
    permit: OwnedSemaphorePermit,
    output: mpsc::Sender<Delivered<T>>,
    shared: Arc<PipelineShared>,
}

impl<T: Send + 'static> Completion for PendingSend<T> {
    fn should_dispatch(&self) -> bool {
        !self.shared.is_stopped() && !self.output.is_closed()
    }

    fn complete(self: Box<Self>, result: Result<RecordMetadata>) {
        let Self { correlation_metadata, permit, output, shared } = *self;
        shared.completed.fetch_add(1, Ordering::Relaxed);

        let result = match result {
            Ok(metadata) => SenderResult::success(metadata, correlation_metadata),
            Err(error) if (shared.fatal_predicate)(&error) => {
                warn!(error = %error, "Fatal send failure; terminating pipeline");
                shared.stop(Some(error));
                return;
            },
            Err(error) if shared.stop_on_error => {
                debug!(error = %error, "Send failed; terminating pipeline");
                shared.stop(Some(error));
                return;
            },
            Err(error) => {
                trace!(error = %error, "Send failed; continuing");
                SenderResult::failure(error, correlation_metadata)
            },
        };

        // Capacity equals the permit count, so the channel is never full.
        if output.try_send(Delivered { result, _permit: permit }).is_err() {
            trace!("Result stream dropped; discarding result");
        }
    }
}

struct RecordCodec<K, V> {
    key: Option<Arc<dyn Serializer<K>>>,
    value: Option<Arc<dyn Serializer<V>>>,
}

impl<K, V> RecordCodec<K, V> {
    fn encode(&self, record: ProducerRecord<K, V>) -> Result<SerializedRecord> {
        let key = match (&record.key, &self.key) {
            (Some(key), Some(serializer)) => Some(serializer.serialize(&record.topic, key)?),
            (Some(_), None) => return Err(Error::configuration("key serializer is not configured")),
            (None, _) => None,
        };
        let value = match (&record.value, &self.value) {
            (Some(value), Some(serializer)) => Some(serializer.serialize(&record.topic, value)?),
            (Some(_), None) => {
                return Err(Error::configuration("value serializer is not configured"))
            },
            (None, _) => None,
        };
        Ok(record.map_payload(key, value))
    }
}

/// Stream of per-record results of one send pipeline.
///
/// Yields one `Ok(SenderResult)` per acknowledged record, in acknowledgement
/// order. If the pipeline terminates with an error, the stream yields every
/// result that was still in flight and then a single `Err` before ending.
/// Dropping the stream cancels the pipeline: no further records are pulled
/// and late results are discarded.
pub struct SendResults<T> {
    results: mpsc::Receiver<Delivered<T>>,
    shared: Arc<PipelineShared>,
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    finished: bool,
}

impl<T> SendResults<T> {
    /// Current lifecycle state of the pipeline.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Records pulled from the input and not yet taken from this stream.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.semaphore.available_permits()
    }

    /// Records handed to the producer so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }

    /// Records whose outcome is known.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }
}

impl<T> Stream for SendResults<T> {
    type Item = Result<SenderResult<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.results.poll_recv(cx) {
            Poll::Ready(Some(delivered)) => Poll::Ready(Some(Ok(delivered.result))),
            Poll::Ready(None) => {
                this.finished = true;
                this.shared.advance(PipelineState::Terminated);
                Poll::Ready(this.shared.error.lock().take().map(Err))
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for SendResults<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.stop(None);
        }
    }
}

impl<T> fmt::Debug for SendResults<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendResults")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("submitted", &self.submitted())
            .field("completed", &self.completed())
            .finish()
    }
}

/// Start a pipeline for `records` on `runtime`.
pub(crate) fn launch<K, V, T, S>(
    handle: Arc<ProducerHandle>,
    options: &SenderOptions<K, V>,
    runtime: &tokio::runtime::Handle,
    records: S,
) -> SendResults<T>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    T: Send + 'static,
    S: Stream<Item = SenderRecord<K, V, T>> + Send + 'static,
{
    let max_in_flight = options.max_in_flight();
    let semaphore = Arc::new(Semaphore::new(max_in_flight));
    let (output, results) = mpsc::channel(max_in_flight);
    let (stop, _) = watch::channel(false);
    let shared = Arc::new(PipelineShared {
        stop_on_error: options.stop_on_error(),
        fatal_predicate: options.fatal_predicate(),
        stop,
        error: Mutex::new(None),
        state: AtomicU8::new(PipelineState::Idle as u8),
        submitted: AtomicU64::new(0),
        completed: AtomicU64::new(0),
    });
    let codec = RecordCodec {
        key: options.key_serializer().cloned(),
        value: options.value_serializer().cloned(),
    };

    runtime.spawn(drive(
        handle,
        codec,
        Arc::clone(&semaphore),
        output,
        Arc::clone(&shared),
        records,
    ));

    SendResults { results, shared, semaphore, max_in_flight, finished: false }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn drive<K, V, T, S>(
    handle: Arc<ProducerHandle>,
    codec: RecordCodec<K, V>,
    semaphore: Arc<Semaphore>,
    output: mpsc::Sender<Delivered<T>>,
    shared: Arc<PipelineShared>,
    records: S,
) where
    T: Send + 'static,
    S: Stream<Item = SenderRecord<K, V, T>>,
{
    let mut stop = shared.stop.subscribe();
    let mut records = std::pin::pin!(records);
    shared.advance(PipelineState::Running);

    loop {
        let permit = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            () = output.closed() => {
                debug!("Result stream dropped; cancelling pipeline");
                shared.stop(None);
                break;
            },
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            () = output.closed() => {
                debug!("Result stream dropped; cancelling pipeline");
                shared.stop(None);
                break;
            },
            next = records.next() => next,
        };
        let Some(SenderRecord { record, correlation_metadata }) = next else {
            trace!("Input stream completed");
            break;
        };

        let pending = Box::new(PendingSend {
            correlation_metadata,
            permit,
            output: output.clone(),
            shared: Arc::clone(&shared),
        });

        let serialized = match codec.encode(record) {
            Ok(serialized) => serialized,
            Err(e) => {
                pending.complete(Err(e));
                continue;
            },
        };

        let dispatched = match handle.worker().await {
            Ok(worker) => ProducerHandle::dispatch(worker, serialized, pending),
            Err(e) => Err(e),
        };
        if let Err(e) = dispatched {
            debug!(error = %e, "Producer unavailable; terminating pipeline");
            shared.stop(Some(e));
            break;
        }
        shared.submitted.fetch_add(1, Ordering::Relaxed);
    }

    shared.advance(PipelineState::Draining);
    debug!(
        submitted = shared.submitted.load(Ordering::Relaxed),
        "Pipeline stopped pulling records"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::serializer::{IntegerSerializer, StringSerializer};

    #[test]
    fn test_state_ordering() {
        assert!(PipelineState::Idle < PipelineState::Running);
        assert!(PipelineState::Draining < PipelineState::Terminated);
        assert_eq!(PipelineState::from_u8(PipelineState::Draining as u8), PipelineState::Draining);
    }

    #[test]
    fn test_codec_serializes_key_and_value() {
        let codec: RecordCodec<i32, String> = RecordCodec {
            key: Some(Arc::new(IntegerSerializer)),
            value: Some(Arc::new(StringSerializer)),
        };
        let record = ProducerRecord::new("t", "abc".to_string()).with_key(1).with_partition(2);
        let serialized = codec.encode(record).unwrap();
        assert_eq!(serialized.key.as_deref(), Some(&[0, 0, 0, 1][..]));
        assert_eq!(serialized.value.as_deref(), Some(&b"abc"[..]));
        assert_eq!(serialized.partition, Some(2));
    }

    #[test]
    fn test_codec_keeps_tombstones() {
        let codec: RecordCodec<i32, String> = RecordCodec {
            key: Some(Arc::new(IntegerSerializer)),
            value: Some(Arc::new(StringSerializer)),
        };
        let serialized = codec.encode(ProducerRecord::tombstone("t", 5)).unwrap();
        assert!(serialized.value.is_none());
        assert_eq!(serialized.serialized_value_size(), -1);
    }

    #[test]
    fn test_first_stop_error_wins() {
        let (stop, _) = watch::channel(false);
        let shared = PipelineShared {
            stop_on_error: true,
            fatal_predicate: Arc::new(Error::is_authentication),
            stop,
            error: Mutex::new(None),
            state: AtomicU8::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        };
        shared.stop(Some(Error::timeout("first")));
        shared.stop(Some(Error::Closed));
        assert!(shared.is_stopped());
        assert_eq!(*shared.error.lock(), Some(Error::timeout("first")));
    }
}
