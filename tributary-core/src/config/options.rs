//! Immutable sender options with fluent mutators.

use crate::config::schema::{
    SenderConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_MAX_IN_FLIGHT, TRANSACTIONAL_ID_CONFIG,
};
use crate::serializer::Serializer;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a failure leaves the client session unusable.
pub type FatalPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Options for one sender and the producer it owns.
///
/// Every `with_*` method consumes the options and returns an updated copy,
/// so an options value can be shared and specialised without interference.
pub struct SenderOptions<K, V> {
    properties: BTreeMap<String, String>,
    key_serializer: Option<Arc<dyn Serializer<K>>>,
    value_serializer: Option<Arc<dyn Serializer<V>>>,
    scheduler: Option<tokio::runtime::Handle>,
    max_in_flight: usize,
    stop_on_error: bool,
    close_timeout: Duration,
    fatal_predicate: FatalPredicate,
}

impl<K, V> SenderOptions<K, V> {
    /// Options with defaults and no client properties.
    #[must_use]
    pub fn new() -> Self {
        Self::from_properties(BTreeMap::new())
    }

    /// Options seeded with raw client properties.
    #[must_use]
    pub fn from_properties(properties: BTreeMap<String, String>) -> Self {
        Self {
            properties,
            key_serializer: None,
            value_serializer: None,
            scheduler: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            stop_on_error: true,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            fatal_predicate: Arc::new(Error::is_authentication),
        }
    }

    /// Options built from a loaded [`SenderConfig`].
    #[must_use]
    pub fn from_config(config: &SenderConfig) -> Self {
        Self::from_properties(config.client_properties())
            .with_max_in_flight(config.max_in_flight)
            .with_stop_on_error(config.stop_on_error)
            .with_close_timeout(config.close_timeout())
    }

    /// All client properties.
    #[must_use]
    pub const fn producer_properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// A single client property.
    #[must_use]
    pub fn producer_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Set a client property.
    #[must_use]
    pub fn with_producer_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Key serializer, if configured.
    #[must_use]
    pub fn key_serializer(&self) -> Option<&Arc<dyn Serializer<K>>> {
        self.key_serializer.as_ref()
    }

    /// Set the key serializer.
    #[must_use]
    pub fn with_key_serializer(mut self, serializer: impl Serializer<K> + 'static) -> Self {
        self.key_serializer = Some(Arc::new(serializer));
        self
    }

    /// Value serializer, if configured.
    #[must_use]
    pub fn value_serializer(&self) -> Option<&Arc<dyn Serializer<V>>> {
        self.value_serializer.as_ref()
    }

    /// Set the value serializer.
    #[must_use]
    pub fn with_value_serializer(mut self, serializer: impl Serializer<V> + 'static) -> Self {
        self.value_serializer = Some(Arc::new(serializer));
        self
    }

    /// Runtime on which pipeline drivers run; `None` means the caller's runtime.
    #[must_use]
    pub const fn scheduler(&self) -> Option<&tokio::runtime::Handle> {
        self.scheduler.as_ref()
    }

    /// Run pipeline drivers and result delivery on `handle`.
    #[must_use]
    pub fn with_scheduler(mut self, handle: tokio::runtime::Handle) -> Self {
        self.scheduler = Some(handle);
        self
    }

    /// Maximum records dispatched but not yet acknowledged.
    #[must_use]
    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Set the in-flight bound; must be at least one.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Whether the first failure stops a send sequence.
    #[must_use]
    pub const fn stop_on_error(&self) -> bool {
        self.stop_on_error
    }

    /// Set the stop-on-error policy.
    #[must_use]
    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    /// Grace period for outstanding acknowledgements when closing.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Set the close timeout.
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Transactional id, if one is configured and non-empty.
    #[must_use]
    pub fn transactional_id(&self) -> Option<&str> {
        self.producer_property(TRANSACTIONAL_ID_CONFIG).filter(|id| !id.is_empty())
    }

    /// Set the transactional id.
    #[must_use]
    pub fn with_transactional_id(self, transactional_id: impl Into<String>) -> Self {
        self.with_producer_property(TRANSACTIONAL_ID_CONFIG, transactional_id)
    }

    /// Whether the producer runs in transactional mode.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.transactional_id().is_some()
    }

    /// Whether `error` is fatal for the client session.
    #[must_use]
    pub fn is_fatal(&self, error: &Error) -> bool {
        (self.fatal_predicate)(error)
    }

    /// The configured fatal-error predicate.
    #[must_use]
    pub fn fatal_predicate(&self) -> FatalPredicate {
        Arc::clone(&self.fatal_predicate)
    }

    /// Replace the fatal-error predicate.
    #[must_use]
    pub fn with_fatal_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.fatal_predicate = Arc::new(predicate);
        self
    }

    /// Check that the options can drive a sender.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when the in-flight bound is zero, the
    /// close timeout is zero, or a serializer is missing.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::configuration("max_in_flight must be greater than 0"));
        }
        if self.close_timeout.is_zero() {
            return Err(Error::configuration("close_timeout must be greater than 0"));
        }
        if self.key_serializer.is_none() {
            return Err(Error::configuration("key serializer is not configured"));
        }
        if self.value_serializer.is_none() {
            return Err(Error::configuration("value serializer is not configured"));
        }
        Ok(())
    }
}

impl<K, V> Default for SenderOptions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for SenderOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            properties: self.properties.clone(),
            key_serializer: self.key_serializer.clone(),
            value_serializer: self.value_serializer.clone(),
            scheduler: self.scheduler.clone(),
            max_in_flight: self.max_in_flight,
            stop_on_error: self.stop_on_error,
            close_timeout: self.close_timeout,
            fatal_predicate: Arc::clone(&self.fatal_predicate),
        }
    }
}

impl<K, V> fmt::Debug for SenderOptions<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderOptions")
            .field("properties", &self.properties)
            .field("key_serializer", &self.key_serializer.is_some())
            .field("value_serializer", &self.value_serializer.is_some())
            .field("max_in_flight", &self.max_in_flight)
            .field("stop_on_error", &self.stop_on_error)
            .field("close_timeout", &self.close_timeout)
            .finish_non_exhaustive()
    }
}
