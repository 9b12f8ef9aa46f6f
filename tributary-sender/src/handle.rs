//! Lazily created, shared producer handle.
//!
//! A handle owns one [`ProducerClient`] on a dedicated worker thread. Every
//! interaction with the client (dispatching records, transaction control,
//! user callbacks, flush and close) is a [`Command`] on the worker's queue,
//! and client delivery callbacks post their acknowledgement back to the same
//! queue. The client is therefore only ever touched by one thread, in
//! program order.

use crate::transaction::{TransactionObserver, TransactionOp, TransactionState};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, error, info, trace, warn};
use tributary_core::config::FatalPredicate;
use tributary_core::{
    Error, ProducerClient, ProducerFactory, RecordMetadata, Result, SenderOptions,
    SerializedRecord,
};

static WORKER_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Receiver of one record's outcome, owned by the worker while the record is
/// in flight.
pub(crate) trait Completion: Send {
    /// Whether the record should still be handed to the client.
    fn should_dispatch(&self) -> bool;

    /// Resolve the record. Called at most once, on the worker thread.
    fn complete(self: Box<Self>, result: Result<RecordMetadata>);
}

pub(crate) type Invocation = Box<dyn FnOnce(&mut dyn ProducerClient) + Send>;

pub(crate) enum Command {
    Send { record: SerializedRecord, completion: Box<dyn Completion> },
    Ack { id: u64, result: Result<RecordMetadata> },
    Transaction { op: TransactionOp, reply: oneshot::Sender<Result<()>> },
    Invoke(Invocation),
    Close { reply: Option<oneshot::Sender<Result<()>>> },
}

/// The subset of sender options the worker needs.
#[derive(Clone)]
pub(crate) struct HandleSettings {
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) transactional_id: Option<String>,
    pub(crate) close_timeout: Duration,
    pub(crate) fatal_predicate: FatalPredicate,
}

impl HandleSettings {
    pub(crate) fn from_options<K, V>(options: &SenderOptions<K, V>) -> Self {
        Self {
            properties: options.producer_properties().clone(),
            transactional_id: options.transactional_id().map(str::to_string),
            close_timeout: options.close_timeout(),
            fatal_predicate: options.fatal_predicate(),
        }
    }
}

/// State published by the worker and read by any thread.
#[derive(Default)]
struct HandleShared {
    txn_state: AtomicU8,
    in_flight: AtomicUsize,
    observer: Mutex<Option<TransactionObserver>>,
}

impl HandleShared {
    fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.txn_state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TransactionState) {
        self.txn_state.store(state as u8, Ordering::Release);
    }
}

pub(crate) struct WorkerRef {
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

/// Shared handle to one producer client.
///
/// The client is created on first use and closed by [`ProducerHandle::close`]
/// or, failing that, when the last reference to the handle is dropped.
pub(crate) struct ProducerHandle {
    factory: Arc<dyn ProducerFactory>,
    settings: HandleSettings,
    shared: Arc<HandleShared>,
    worker: OnceCell<WorkerRef>,
    closed: AtomicBool,
}

impl ProducerHandle {
    pub(crate) fn new(factory: Arc<dyn ProducerFactory>, settings: HandleSettings) -> Self {
        Self {
            factory,
            settings,
            shared: Arc::new(HandleShared::default()),
            worker: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn transactional_id(&self) -> Option<&str> {
        self.settings.transactional_id.as_deref()
    }

    pub(crate) fn transaction_state(&self) -> TransactionState {
        self.shared.state()
    }

    pub(crate) fn set_observer(&self, observer: TransactionObserver) {
        *self.shared.observer.lock() = Some(observer);
    }

    /// Records handed to the client and not yet acknowledged.
    pub(crate) fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.worker.initialized()
    }

    /// The running worker, starting it on first use.
    pub(crate) async fn worker(&self) -> Result<&WorkerRef> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let worker = self.worker.get_or_try_init(|| self.start_worker()).await?;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(worker)
    }

    async fn start_worker(&self) -> Result<WorkerRef> {
        let (commands_tx, commands_rx) = channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let name = format!("tributary-producer-{}", WORKER_SEQUENCE.fetch_add(1, Ordering::Relaxed));

        let factory = Arc::clone(&self.factory);
        let settings = self.settings.clone();
        let shared = Arc::clone(&self.shared);
        let acks = commands_tx.clone();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let client = match create_client(factory.as_ref(), &settings) {
                    Ok(client) => client,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    },
                };
                let _ = ready_tx.send(Ok(()));
                Worker::new(client, settings, shared, commands_rx, acks).run();
            })
            .map_err(|e| Error::internal(format!("Failed to spawn producer worker: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(worker = %name, transactional_id = ?self.settings.transactional_id, "Producer created");
                Ok(WorkerRef { commands: commands_tx, thread: Mutex::new(Some(thread)), name })
            },
            Ok(Err(e)) => {
                error!(worker = %name, error = %e, "Failed to create producer");
                Err(e)
            },
            Err(_) => Err(Error::internal("Producer worker exited during startup")),
        }
    }

    /// Queue a record for dispatch.
    ///
    /// On failure the completion is dropped unresolved.
    pub(crate) fn dispatch(
        worker: &WorkerRef,
        record: SerializedRecord,
        completion: Box<dyn Completion>,
    ) -> Result<()> {
        worker
            .commands
            .send(Command::Send { record, completion })
            .map_err(|_| Error::Closed)
    }

    pub(crate) async fn transaction(&self, op: TransactionOp) -> Result<()> {
        let worker = self.worker().await?;
        let (reply, response) = oneshot::channel();
        trace!(operation = op.name(), "Queueing transaction operation");
        worker
            .commands
            .send(Command::Transaction { op, reply })
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Run `f` against the client on the worker thread.
    pub(crate) async fn invoke<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn ProducerClient) -> R + Send + 'static,
        R: Send + 'static,
    {
        let worker = self.worker().await?;
        let (reply, response) = oneshot::channel();
        let invocation: Invocation = Box::new(move |client| {
            let _ = reply.send(f(client));
        });
        worker.commands.send(Command::Invoke(invocation)).map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)
    }

    /// Flush, wait for outstanding acknowledgements up to the close timeout,
    /// then close the client. Repeated calls return immediately.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(worker) = self.worker.get() else {
            debug!("Closing a sender whose producer was never created");
            return Ok(());
        };

        let (reply, response) = oneshot::channel();
        if worker.commands.send(Command::Close { reply: Some(reply) }).is_err() {
            return Ok(());
        }
        let result = response.await.unwrap_or(Ok(()));

        if let Some(thread) = worker.thread.lock().take() {
            let name = worker.name.clone();
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(worker = %name, "Producer worker did not exit cleanly");
            }
        }
        result
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.worker.get() {
            debug!(worker = %worker.name, "Last sender reference dropped; closing producer");
            let _ = worker.commands.send(Command::Close { reply: None });
        }
    }
}

impl fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("transactional_id", &self.settings.transactional_id)
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

fn create_client(
    factory: &dyn ProducerFactory,
    settings: &HandleSettings,
) -> Result<Box<dyn ProducerClient>> {
    let mut client = factory.create_producer(&settings.properties)?;
    if settings.transactional_id.is_some() {
        if let Err(e) = client.init_transactions() {
            let _ = client.close(Duration::ZERO);
            return Err(e);
        }
    }
    Ok(client)
}

struct Worker {
    client: Box<dyn ProducerClient>,
    settings: HandleSettings,
    shared: Arc<HandleShared>,
    commands: Receiver<Command>,
    acks: Sender<Command>,
    pending: HashMap<u64, Box<dyn Completion>>,
    deferred: VecDeque<Command>,
    next_id: u64,
    fatal: Option<Error>,
}

impl Worker {
    fn new(
        client: Box<dyn ProducerClient>,
        settings: HandleSettings,
        shared: Arc<HandleShared>,
        commands: Receiver<Command>,
        acks: Sender<Command>,
    ) -> Self {
        Self {
            client,
            settings,
            shared,
            commands,
            acks,
            pending: HashMap::new(),
            deferred: VecDeque::new(),
            next_id: 0,
            fatal: None,
        }
    }

    fn run(mut self) {
        debug!("Producer worker started");
        while let Some(command) = self.next_command() {
            match command {
                Command::Send { record, completion } => self.send(record, completion),
                Command::Ack { id, result } => self.acknowledge(id, result),
                Command::Transaction { op, reply } => {
                    let _ = reply.send(self.transaction(op));
                },
                Command::Invoke(f) => f(self.client.as_mut()),
                Command::Close { reply } => {
                    let result = self.close();
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    break;
                },
            }
        }
        debug!("Producer worker stopped");
    }

    /// Commands held back while draining come first, in arrival order.
    fn next_command(&mut self) -> Option<Command> {
        self.deferred.pop_front().or_else(|| self.commands.recv().ok())
    }

    fn is_transactional(&self) -> bool {
        self.settings.transactional_id.is_some()
    }

    fn is_fatal(&self, error: &Error) -> bool {
        (self.settings.fatal_predicate)(error)
    }

    fn send(&mut self, record: SerializedRecord, completion: Box<dyn Completion>) {
        if !completion.should_dispatch() {
            trace!(topic = %record.topic, "Skipping record of a stopped pipeline");
            return;
        }
        if let Some(error) = &self.fatal {
            completion.complete(Err(error.clone()));
            return;
        }
        if self.is_transactional() && self.shared.state() != TransactionState::Active {
            completion.complete(Err(Error::illegal_state(
                "Cannot send records of a transactional sender without an active transaction",
            )));
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, completion);
        self.shared.in_flight.fetch_add(1, Ordering::Relaxed);

        trace!(topic = %record.topic, id, "Dispatching record");
        let acks = self.acks.clone();
        self.client.send(
            record,
            Box::new(move |result| {
                let _ = acks.send(Command::Ack { id, result });
            }),
        );
    }

    fn acknowledge(&mut self, id: u64, result: Result<RecordMetadata>) {
        let Some(completion) = self.pending.remove(&id) else {
            trace!(id, "Ignoring acknowledgement of an already resolved record");
            return;
        };
        self.shared.in_flight.fetch_sub(1, Ordering::Relaxed);

        if let Err(e) = &result {
            self.record_fatal(e);
        }
        completion.complete(result);
    }

    fn check_fatal(&self) -> Result<()> {
        self.fatal.as_ref().map_or(Ok(()), |e| Err(e.clone()))
    }

    fn require_state(&self, expected: TransactionState, action: &str) -> Result<()> {
        let state = self.shared.state();
        if state == expected {
            Ok(())
        } else {
            Err(Error::illegal_state(format!("Cannot {action} a transaction in state {state}")))
        }
    }

    fn transaction(&mut self, op: TransactionOp) -> Result<()> {
        if !self.is_transactional() {
            return Err(Error::illegal_state("Producer is not transactional"));
        }
        match op {
            TransactionOp::Begin => {
                self.check_fatal()?;
                self.require_state(TransactionState::None, "begin")?;
                if let Err(e) = self.client.begin_transaction() {
                    self.record_fatal(&e);
                    return Err(e);
                }
                self.shared.set_state(TransactionState::Active);
                debug!("Began transaction");
                Ok(())
            },
            TransactionOp::SendOffsets { offsets, consumer_group_id } => {
                if offsets.is_empty() {
                    trace!("No offsets to send");
                    return Ok(());
                }
                self.check_fatal()?;
                self.require_state(TransactionState::Active, "send offsets to")?;
                if let Err(e) = self.client.send_offsets_to_transaction(&offsets, &consumer_group_id) {
                    self.record_fatal(&e);
                    return Err(e);
                }
                debug!(group = %consumer_group_id, partitions = offsets.len(), "Sent offsets to transaction");
                Ok(())
            },
            TransactionOp::Commit => self.finish_transaction(true),
            TransactionOp::Abort => self.finish_transaction(false),
        }
    }

    fn finish_transaction(&mut self, commit: bool) -> Result<()> {
        let (action, transitional) = if commit {
            ("commit", TransactionState::Committing)
        } else {
            ("abort", TransactionState::Aborting)
        };
        self.require_state(TransactionState::Active, action)?;
        if commit {
            self.check_fatal()?;
        }

        self.shared.set_state(transitional);
        let drained = self.drain_pending();

        if commit {
            if let Some(fatal) = self.fatal.clone() {
                self.abort_open_transaction();
                return Err(fatal);
            }
            if let Err(e) = drained {
                warn!(pending = self.pending.len(), "Records unacknowledged at commit");
                self.shared.set_state(TransactionState::Active);
                return Err(e);
            }
        } else if drained.is_err() {
            warn!(pending = self.pending.len(), "Aborting with unacknowledged records");
        }

        let result = if commit {
            self.client.commit_transaction()
        } else {
            self.client.abort_transaction()
        };

        match result {
            Ok(()) => {
                self.shared.set_state(TransactionState::None);
                debug!(committed = commit, "Transaction completed");
                self.notify(commit);
                Ok(())
            },
            Err(e) => {
                warn!(error = %e, "Failed to {action} transaction");
                if self.is_fatal(&e) {
                    self.record_fatal(&e);
                    self.shared.set_state(TransactionState::None);
                } else {
                    self.shared.set_state(TransactionState::Active);
                }
                Err(e)
            },
        }
    }

    /// Flush the client and resolve every dispatched record before a
    /// transaction boundary. Other commands arriving meanwhile are deferred.
    fn drain_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let timeout = self.settings.close_timeout;
        let deadline = Instant::now().checked_add(timeout);
        let remaining =
            || deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));

        trace!(pending = self.pending.len(), "Draining acknowledgements");
        if let Err(e) = self.client.flush(remaining()) {
            warn!(error = %e, "Flush before transaction boundary did not complete");
        }
        while !self.pending.is_empty() {
            match self.commands.recv_timeout(remaining()) {
                Ok(Command::Ack { id, result }) => self.acknowledge(id, result),
                Ok(other) => self.deferred.push_back(other),
                Err(_) => {
                    return Err(Error::timeout("record acknowledgement before transaction end"))
                },
            }
        }
        Ok(())
    }

    fn notify(&self, committed: bool) {
        let observer = self.shared.observer.lock().clone();
        if let Some(observer) = observer {
            observer(committed);
        }
    }

    fn record_fatal(&mut self, error: &Error) {
        if self.fatal.is_some() || !self.is_fatal(error) {
            return;
        }
        error!(error = %error, "Fatal producer error; rejecting further sends");
        self.fatal = Some(error.clone());
        if self.shared.state() == TransactionState::Active {
            self.abort_open_transaction();
        }
    }

    /// Abort after a fatal error. The client's own failure is only logged
    /// since the session is already unusable.
    fn abort_open_transaction(&mut self) {
        warn!("Aborting open transaction after fatal error");
        self.shared.set_state(TransactionState::Aborting);
        if let Err(e) = self.client.abort_transaction() {
            debug!(error = %e, "Abort after fatal error failed");
        }
        self.shared.set_state(TransactionState::None);
        self.notify(false);
    }

    fn close(&mut self) -> Result<()> {
        let timeout = self.settings.close_timeout;
        let deadline = Instant::now().checked_add(timeout);
        let remaining =
            || deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));

        info!(pending = self.pending.len(), "Closing producer");
        if self.shared.state() == TransactionState::Active {
            warn!("Closing producer with an open transaction");
        }
        if let Err(e) = self.client.flush(remaining()) {
            warn!(error = %e, "Flush before close did not complete");
        }

        while !self.pending.is_empty() {
            match self.commands.recv_timeout(remaining()) {
                Ok(Command::Ack { id, result }) => self.acknowledge(id, result),
                Ok(other) => self.reject(other),
                Err(_) => break,
            }
        }

        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "Close timeout elapsed with unacknowledged records");
        }
        for (_, completion) in self.pending.drain() {
            completion.complete(Err(Error::timeout("record acknowledgement before close")));
        }
        self.shared.in_flight.store(0, Ordering::Relaxed);

        let result = self.client.close(remaining());
        self.shared.set_state(TransactionState::None);

        let deferred = std::mem::take(&mut self.deferred);
        for command in deferred {
            self.reject(command);
        }
        while let Ok(command) = self.commands.try_recv() {
            self.reject(command);
        }
        result
    }

    fn reject(&mut self, command: Command) {
        match command {
            Command::Send { completion, .. } => completion.complete(Err(Error::Closed)),
            Command::Ack { id, result } => self.acknowledge(id, result),
            Command::Transaction { reply, .. } => {
                let _ = reply.send(Err(Error::Closed));
            },
            Command::Invoke(_) => {},
            Command::Close { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            },
        }
    }
}
