//! The sender facade.

use crate::handle::{HandleSettings, ProducerHandle};
use crate::pipeline::{self, SendResults};
use crate::transaction::TransactionManager;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tributary_core::{
    Error, ProducerClient, ProducerFactory, Result, SenderOptions, SenderRecord, SenderResult,
};

/// Reactive sender of records to a broker.
///
/// All pipelines started from one sender share a single lazily created
/// producer. The producer is created by the first operation that needs it
/// and closed by [`KafkaSender::close`] or when the sender, its transaction
/// manager and every pipeline it started have been dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use futures::StreamExt;
/// use tributary_core::prelude::*;
/// use tributary_sender::KafkaSender;
///
/// # async fn run(factory: impl ProducerFactory) -> tributary_core::Result<()> {
/// let options = SenderOptions::<i32, String>::new()
///     .with_key_serializer(IntegerSerializer)
///     .with_value_serializer(StringSerializer);
/// let sender = KafkaSender::create(factory, options)?;
///
/// let records = (0..10).map(|i| {
///     SenderRecord::create(ProducerRecord::new("demo", format!("message {i}")).with_key(i), i)
/// });
/// let mut results = sender.send_all(records);
/// while let Some(result) = results.next().await {
///     let result = result?;
///     println!("{} -> {:?}", result.correlation_metadata(), result.record_metadata());
/// }
/// sender.close().await
/// # }
/// ```
pub struct KafkaSender<K, V> {
    options: SenderOptions<K, V>,
    handle: Arc<ProducerHandle>,
    runtime: tokio::runtime::Handle,
}

impl<K, V> KafkaSender<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a sender. No producer is created until it is first needed.
    ///
    /// Pipelines run on the options' scheduler if one is set, otherwise on
    /// the runtime this is called from.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the options are invalid or no
    /// scheduler is configured outside of a Tokio runtime.
    pub fn create<F: ProducerFactory>(factory: F, options: SenderOptions<K, V>) -> Result<Self> {
        Self::with_factory(Arc::new(factory), options)
    }

    /// Create a sender from a shared factory.
    ///
    /// # Errors
    /// See [`KafkaSender::create`].
    pub fn with_factory(
        factory: Arc<dyn ProducerFactory>,
        options: SenderOptions<K, V>,
    ) -> Result<Self> {
        options.validate()?;
        let runtime = match options.scheduler() {
            Some(scheduler) => scheduler.clone(),
            None => tokio::runtime::Handle::try_current().map_err(|e| {
                Error::configuration(format!(
                    "No scheduler configured and no Tokio runtime is running: {e}"
                ))
            })?,
        };

        let handle = Arc::new(ProducerHandle::new(factory, HandleSettings::from_options(&options)));
        info!(
            transactional_id = ?options.transactional_id(),
            max_in_flight = options.max_in_flight(),
            stop_on_error = options.stop_on_error(),
            "Created sender"
        );
        Ok(Self { options, handle, runtime })
    }

    /// Send every record of `records` and stream back one result per record.
    ///
    /// The returned stream is lazy only with respect to delivery: the
    /// pipeline starts pulling from `records` immediately, bounded by
    /// `max_in_flight`.
    pub fn send<T, S>(&self, records: S) -> SendResults<T>
    where
        T: Send + 'static,
        S: Stream<Item = SenderRecord<K, V, T>> + Send + 'static,
    {
        pipeline::launch(Arc::clone(&self.handle), &self.options, &self.runtime, records)
    }

    /// Send a finite collection of records.
    pub fn send_all<T, I>(&self, records: I) -> SendResults<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = SenderRecord<K, V, T>>,
        I::IntoIter: Send + 'static,
    {
        self.send(futures::stream::iter(records))
    }

    /// Send `records` in one transaction.
    ///
    /// Begins a transaction, sends every record and commits if all of them
    /// succeed. Otherwise the transaction is aborted and the first failure
    /// is returned.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for non-transactional senders or if a
    /// transaction is already open, the first send failure, or the commit
    /// failure.
    pub async fn send_transactionally<T, S>(&self, records: S) -> Result<Vec<SenderResult<T>>>
    where
        T: Send + 'static,
        S: Stream<Item = SenderRecord<K, V, T>> + Send + 'static,
    {
        let transactions = self.transaction_manager()?;
        transactions.begin().await?;

        let mut results = self.send(records);
        let mut delivered = Vec::new();
        let mut failure = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(result) => {
                    if failure.is_none() {
                        failure = result.exception().cloned();
                    }
                    delivered.push(result);
                },
                Err(e) => {
                    failure.get_or_insert(e);
                },
            }
        }

        match failure {
            None => {
                transactions.commit().await?;
                Ok(delivered)
            },
            Some(e) => {
                debug!(error = %e, "Aborting transaction after send failure");
                if let Err(abort) = transactions.abort().await {
                    warn!(error = %abort, "Failed to abort transaction");
                }
                Err(e)
            },
        }
    }

    /// The transaction manager of a transactional sender.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if no transactional id is configured.
    pub fn transaction_manager(&self) -> Result<TransactionManager> {
        if !self.options.is_transactional() {
            return Err(Error::illegal_state(
                "Transactions are not enabled: no transactional id is configured",
            ));
        }
        Ok(TransactionManager::new(Arc::clone(&self.handle), self.runtime.clone()))
    }

    /// Run `f` against the underlying client and return its result.
    ///
    /// `f` runs on the producer's worker thread, serialized with record
    /// dispatch; blocking inside it stalls every pipeline of this sender.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] after [`KafkaSender::close`], or the
    /// factory's error if the producer cannot be created.
    pub async fn do_on_producer<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn ProducerClient) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.invoke(f).await
    }

    /// Flush and close the producer, waiting at most the configured close
    /// timeout for outstanding acknowledgements. Records still unacknowledged
    /// afterwards resolve as [`Error::Timeout`]. Idempotent.
    ///
    /// # Errors
    /// Returns the client's error if it failed to shut down cleanly.
    pub async fn close(&self) -> Result<()> {
        let result = self.handle.close().await;
        info!("Sender closed");
        result
    }

    /// Whether [`KafkaSender::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Records currently handed to the producer and not yet acknowledged,
    /// across all pipelines of this sender.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.handle.in_flight()
    }

    /// The options this sender was created with.
    #[must_use]
    pub const fn options(&self) -> &SenderOptions<K, V> {
        &self.options
    }
}

impl<K, V> fmt::Debug for KafkaSender<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSender")
            .field("options", &self.options)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::serializer::{IntegerSerializer, StringSerializer};
    use tributary_testkit::{MockCluster, MockProducerFactory};

    fn options() -> SenderOptions<i32, String> {
        SenderOptions::new()
            .with_key_serializer(IntegerSerializer)
            .with_value_serializer(StringSerializer)
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_options() {
        let factory = MockProducerFactory::new(MockCluster::new());
        let options = SenderOptions::<i32, String>::new();
        assert!(matches!(
            KafkaSender::create(factory, options),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_create_requires_runtime_or_scheduler() {
        let factory = MockProducerFactory::new(MockCluster::new());
        assert!(KafkaSender::create(factory.clone(), options()).is_err());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let sender =
            KafkaSender::create(factory, options().with_scheduler(runtime.handle().clone()))
                .unwrap();
        assert!(!sender.is_closed());
    }

    #[tokio::test]
    async fn test_transaction_manager_requires_transactional_id() {
        let sender =
            KafkaSender::create(MockProducerFactory::new(MockCluster::new()), options()).unwrap();
        assert!(sender.transaction_manager().unwrap_err().is_illegal_state());

        let transactional = KafkaSender::create(
            MockProducerFactory::new(MockCluster::new()),
            options().with_transactional_id("tx-1"),
        )
        .unwrap();
        let manager = transactional.transaction_manager().unwrap();
        assert_eq!(manager.transactional_id(), "tx-1");
    }

    #[tokio::test]
    async fn test_producer_is_created_on_first_use() {
        let factory = MockProducerFactory::new(MockCluster::new());
        let sender = KafkaSender::create(factory.clone(), options()).unwrap();
        assert_eq!(factory.created(), 0);

        let partitions = sender.do_on_producer(|client| client.partitions_for("topic")).await;
        assert!(partitions.is_ok());
        assert_eq!(factory.created(), 1);
        sender.close().await.unwrap();
    }
}
