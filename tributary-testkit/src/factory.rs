//! Factory handing out [`MockProducer`]s.

use crate::cluster::MockCluster;
use crate::producer::MockProducer;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tributary_core::{Error, ProducerClient, ProducerFactory, Result};

#[derive(Default)]
struct Pool {
    free: VecDeque<MockProducer>,
    in_use: Vec<MockProducer>,
    send_delay: Duration,
    fail_next: Option<Error>,
}

/// Producer factory for tests.
///
/// Hands out pre-registered producers first, then fresh ones writing to the
/// factory's cluster. Every producer created is kept for inspection. Clones
/// share the same pool.
#[derive(Clone)]
pub struct MockProducerFactory {
    cluster: MockCluster,
    pool: Arc<Mutex<Pool>>,
}

impl MockProducerFactory {
    /// A factory creating producers on `cluster`.
    #[must_use]
    pub fn new(cluster: MockCluster) -> Self {
        Self { cluster, pool: Arc::new(Mutex::new(Pool::default())) }
    }

    /// Hand out `producer` before creating fresh ones.
    pub fn add_producer(&self, producer: MockProducer) {
        self.pool.lock().free.push_back(producer);
    }

    /// Send delay applied to freshly created producers.
    #[must_use]
    pub fn with_send_delay(self, delay: Duration) -> Self {
        self.pool.lock().send_delay = delay;
        self
    }

    /// Fail the next `create_producer` call with `error`.
    pub fn fail_next_creation(&self, error: Error) {
        self.pool.lock().fail_next = Some(error);
    }

    /// Number of producers created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.pool.lock().in_use.len()
    }

    /// Every producer created so far, oldest first.
    #[must_use]
    pub fn producers(&self) -> Vec<MockProducer> {
        self.pool.lock().in_use.clone()
    }

    /// The most recently created producer.
    #[must_use]
    pub fn last_producer(&self) -> Option<MockProducer> {
        self.pool.lock().in_use.last().cloned()
    }

    /// The cluster fresh producers write to.
    #[must_use]
    pub const fn cluster(&self) -> &MockCluster {
        &self.cluster
    }
}

impl ProducerFactory for MockProducerFactory {
    fn create_producer(
        &self,
        properties: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ProducerClient>> {
        let mut pool = self.pool.lock();
        if let Some(error) = pool.fail_next.take() {
            return Err(error);
        }
        let producer = match pool.free.pop_front() {
            Some(producer) => producer,
            None => {
                let producer = MockProducer::new(self.cluster.clone());
                producer.set_send_delay(pool.send_delay);
                producer
            },
        };
        producer.configure(properties);
        pool.in_use.push(producer.clone());
        Ok(Box::new(producer))
    }
}

impl std::fmt::Debug for MockProducerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProducerFactory").field("created", &self.created()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::config::TRANSACTIONAL_ID_CONFIG;

    #[test]
    fn test_pool_order_and_tracking() {
        let cluster = MockCluster::new();
        let factory = MockProducerFactory::new(cluster.clone());
        let registered = MockProducer::new(cluster);
        factory.add_producer(registered.clone());

        let properties =
            BTreeMap::from([(TRANSACTIONAL_ID_CONFIG.to_string(), "tx".to_string())]);
        factory.create_producer(&properties).unwrap();
        factory.create_producer(&BTreeMap::new()).unwrap();

        assert_eq!(factory.created(), 2);
        assert!(registered.is_transactional());
        assert!(!factory.last_producer().unwrap().is_transactional());
    }

    #[test]
    fn test_injected_creation_failure() {
        let factory = MockProducerFactory::new(MockCluster::new());
        factory.fail_next_creation(Error::configuration("unreachable"));
        assert!(factory.create_producer(&BTreeMap::new()).is_err());
        assert!(factory.create_producer(&BTreeMap::new()).is_ok());
        assert_eq!(factory.created(), 1);
    }
}
