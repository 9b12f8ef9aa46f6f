//! # Configuration Schema
//!
//! File and environment facing configuration for a sender. The loader fills
//! these structures, the validator checks them, and
//! [`SenderOptions::from_config`](crate::config::SenderOptions::from_config)
//! turns them into runtime options.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

/// Default bound on records dispatched but not yet acknowledged.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Default close timeout, effectively unbounded.
#[allow(clippy::cast_sign_loss)]
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(i64::MAX as u64);

/// Client property naming the broker bootstrap list.
pub const BOOTSTRAP_SERVERS_CONFIG: &str = "bootstrap.servers";

/// Client property naming the client instance.
pub const CLIENT_ID_CONFIG: &str = "client.id";

/// Client property enabling transactions when non-empty.
pub const TRANSACTIONAL_ID_CONFIG: &str = "transactional.id";

/// Sender configuration as loaded from files and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SenderConfig {
    /// Broker addresses, `host:port`
    #[validate(length(min = 1))]
    pub bootstrap_servers: Vec<String>,

    /// Optional client id reported to the broker
    pub client_id: Option<String>,

    /// Transactional id; a non-empty value makes the sender transactional
    pub transactional_id: Option<String>,

    /// Maximum records dispatched but not yet acknowledged
    #[validate(range(min = 1))]
    pub max_in_flight: usize,

    /// Stop pulling input after the first failed send
    pub stop_on_error: bool,

    /// Grace period for outstanding acknowledgements on close
    #[validate(range(min = 1))]
    pub close_timeout_ms: u64,

    /// Additional raw client properties
    pub properties: BTreeMap<String, String>,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            client_id: None,
            transactional_id: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            stop_on_error: true,
            close_timeout_ms: u64::try_from(DEFAULT_CLOSE_TIMEOUT.as_millis())
                .unwrap_or(u64::MAX),
            properties: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SenderConfig {
    /// Close timeout as a [`Duration`].
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Flatten into Kafka-style client properties.
    #[must_use]
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = self.properties.clone();
        props.insert(BOOTSTRAP_SERVERS_CONFIG.to_string(), self.bootstrap_servers.join(","));
        if let Some(client_id) = &self.client_id {
            props.insert(CLIENT_ID_CONFIG.to_string(), client_id.clone());
        }
        if let Some(transactional_id) = &self.transactional_id {
            props.insert(TRANSACTIONAL_ID_CONFIG.to_string(), transactional_id.clone());
        }
        props
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `tributary_sender=debug`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include thread names in text output
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text, thread_names: true }
    }
}
