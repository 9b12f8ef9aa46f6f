//! Configuration management for tributary senders
//!
//! Two layers live here:
//! - [`SenderConfig`]: a serializable schema loaded from TOML files and
//!   `TRIBUTARY_*` environment variables, checked by [`ConfigValidator`]
//! - [`SenderOptions`]: the immutable runtime options a sender is built
//!   from, including serializers, scheduler and the fatal-error predicate
//!
//! # Examples
//!
//! ```rust,no_run
//! use tributary_core::config::{ConfigLoader, SenderOptions};
//! use tributary_core::serializer::{IntegerSerializer, StringSerializer};
//!
//! let config = ConfigLoader::new().load().expect("Failed to load configuration");
//! let options: SenderOptions<i32, String> = SenderOptions::from_config(&config)
//!     .with_key_serializer(IntegerSerializer)
//!     .with_value_serializer(StringSerializer);
//! ```

pub mod loader;
pub mod options;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use options::{FatalPredicate, SenderOptions};
pub use schema::*;
pub use validator::ConfigValidator;

use crate::Result;
use std::path::Path;

/// Load configuration from the default search paths and environment.
///
/// # Errors
/// Returns an error if a configuration file is invalid or validation fails.
pub fn load_default() -> Result<SenderConfig> {
    ConfigLoader::new().load()
}

/// Load configuration from a specific file.
///
/// # Errors
/// Returns an error if the file is unreadable, malformed or invalid.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<SenderConfig> {
    ConfigLoader::load_from_file(path)
}

/// Validate a configuration object.
///
/// # Errors
/// Returns the first validation failure.
pub fn validate(config: &SenderConfig) -> Result<()> {
    ConfigValidator::validate(config)
}
