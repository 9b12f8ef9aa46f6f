//! Logging initialisation.
//!
//! Library code only emits `tracing` events; applications (and tests) call
//! [`init_logging`] once to install a subscriber.

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install a global `tracing` subscriber built from `config`.
///
/// `RUST_LOG` takes precedence over `config.level` when set. Returns
/// `Ok(false)` if a global subscriber was already installed, which makes the
/// call safe to repeat from several tests.
///
/// # Errors
/// Returns [`Error::Configuration`] if the filter directive is invalid.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| Error::configuration(format!("Invalid log filter: {e}")))?;

    let fmt_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(config.thread_names)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(config.thread_names)
            .boxed(),
    };

    Ok(tracing_subscriber::registry().with(fmt_layer.with_filter(filter)).try_init().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_repeatable() {
        let config = LoggingConfig::default();
        let first = init_logging(&config).unwrap();
        let second = init_logging(&config).unwrap();
        // Another test may have installed a subscriber first.
        assert!(!(first && second));
        assert!(!second);
    }
}
