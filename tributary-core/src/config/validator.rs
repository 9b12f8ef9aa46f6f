//! # Configuration Validation
//!
//! Field-level checks come from the `validator` derive on
//! [`SenderConfig`]; the rules here cover what the derive cannot express.

use crate::{
    config::schema::{SenderConfig, BOOTSTRAP_SERVERS_CONFIG, TRANSACTIONAL_ID_CONFIG},
    Error, Result,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use validator::Validate;

/// Upper bound above which an in-flight limit is almost certainly a mistake.
const IN_FLIGHT_WARN_THRESHOLD: usize = 1 << 20;

/// Configuration validator
#[derive(Debug, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Create a new configuration validator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validate a configuration
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first violated rule.
    pub fn validate(config: &SenderConfig) -> Result<()> {
        Self::new().validate_config(config)
    }

    /// Perform full validation of the configuration
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first violated rule.
    pub fn validate_config(&self, config: &SenderConfig) -> Result<()> {
        debug!("Starting configuration validation");

        config.validate().map_err(Error::from)?;

        self.validate_bootstrap_servers(config)?;
        self.validate_transactional(config)?;
        self.validate_logging(config)?;

        if config.max_in_flight > IN_FLIGHT_WARN_THRESHOLD {
            warn!(
                max_in_flight = config.max_in_flight,
                "Very high in-flight limit may buffer large numbers of records"
            );
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_bootstrap_servers(&self, config: &SenderConfig) -> Result<()> {
        for server in &config.bootstrap_servers {
            let Some((host, port)) = server.rsplit_once(':') else {
                return Err(Error::configuration(format!(
                    "Bootstrap server '{server}' must be in host:port form"
                )));
            };
            if host.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "Bootstrap server '{server}' has an empty host"
                )));
            }
            port.parse::<u16>().map_err(|e| {
                Error::configuration(format!("Bootstrap server '{server}' has an invalid port: {e}"))
            })?;
        }

        if config.properties.contains_key(BOOTSTRAP_SERVERS_CONFIG) {
            warn!("'{BOOTSTRAP_SERVERS_CONFIG}' in properties is overridden by bootstrap_servers");
        }
        Ok(())
    }

    fn validate_transactional(&self, config: &SenderConfig) -> Result<()> {
        if let Some(id) = &config.transactional_id {
            if id.trim().is_empty() && !id.is_empty() {
                return Err(Error::configuration("transactional_id must not be blank"));
            }
        }
        if config.transactional_id.is_some()
            && config.properties.contains_key(TRANSACTIONAL_ID_CONFIG)
        {
            return Err(Error::configuration(format!(
                "transactional_id is set twice: use either transactional_id or \
                 properties.\"{TRANSACTIONAL_ID_CONFIG}\""
            )));
        }
        Ok(())
    }

    fn validate_logging(&self, config: &SenderConfig) -> Result<()> {
        EnvFilter::try_new(&config.logging.level).map_err(|e| {
            Error::configuration(format!("Invalid log filter '{}': {e}", config.logging.level))
        })?;
        Ok(())
    }
}
