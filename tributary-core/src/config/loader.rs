//! # Configuration Loading
//!
//! Loads [`SenderConfig`] from defaults, an optional TOML file and
//! `TRIBUTARY_*` environment variables, in that order of precedence.
//! Nested keys use a double underscore: `TRIBUTARY_LOGGING__LEVEL=debug`.

use crate::{
    config::{schema::SenderConfig, validator::ConfigValidator},
    Error, Result,
};
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const CONFIG_FILE_NAMES: [&str; 2] = ["tributary.toml", "sender.toml"];

/// Configuration loader with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("."), PathBuf::from("./config")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("tributary"));
        }
        Self { search_paths, env_prefix: "TRIBUTARY".to_string() }
    }

    /// Add a search path for configuration files
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Search only the given paths
    #[must_use]
    pub fn with_paths_only<P: AsRef<Path>>(mut self, paths: &[P]) -> Self {
        self.search_paths = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self
    }

    /// Set the environment variable prefix
    #[must_use]
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Get the effective search paths being used
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Get the environment prefix being used
    #[must_use]
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    /// Load configuration from all available sources
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if a file cannot be read or parsed,
    /// or if the merged configuration fails validation.
    pub fn load(&self) -> Result<SenderConfig> {
        self.load_with_env(env::vars())
    }

    /// Load configuration using an explicit set of environment variables
    ///
    /// # Errors
    /// See [`ConfigLoader::load`].
    pub fn load_with_env<I>(&self, vars: I) -> Result<SenderConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config_value = toml::Value::try_from(SenderConfig::default())
            .map_err(|e| Error::configuration(format!("Failed to serialize default config: {e}")))?;

        if let Some(config_path) = self.find_config_file() {
            let file_config = Self::load_config_file(&config_path)?;
            config_value = Self::merge_config(config_value, file_config);
            info!("Loaded configuration file: {}", config_path.display());
        } else {
            debug!("No configuration file found in search paths");
        }

        let overrides = self.collect_env_vars(vars);
        for (key, value) in &overrides {
            let parts: Vec<&str> = key.split('.').collect();
            Self::set_nested_value(&mut config_value, &parts, value);
        }
        debug!(count = overrides.len(), "Applied environment variables");

        let config: SenderConfig = config_value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;

        ConfigValidator::validate(&config)?;
        info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the file is unreadable or invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<SenderConfig> {
        let path = path.as_ref();
        info!("Loading configuration from file: {}", path.display());

        let defaults = toml::Value::try_from(SenderConfig::default())
            .map_err(|e| Error::configuration(format!("Failed to serialize default config: {e}")))?;
        let merged = Self::merge_config(defaults, Self::load_config_file(path)?);
        let config: SenderConfig = merged
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to parse config file: {e}")))?;

        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
    }

    fn load_config_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        content.parse::<toml::Value>().map_err(|e| {
            Error::configuration(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    fn merge_config(mut base: toml::Value, override_value: toml::Value) -> toml::Value {
        if let (toml::Value::Table(base_table), toml::Value::Table(override_table)) =
            (&mut base, override_value)
        {
            for (key, value) in override_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        *existing = Self::merge_config(existing.clone(), value);
                    },
                    Some(existing) => *existing = value,
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        }
        base
    }

    fn collect_env_vars<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{}_", self.env_prefix);
        vars.into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|rest| (rest.to_lowercase().replace("__", "."), value))
            })
            .collect()
    }

    fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: &str) {
        let toml::Value::Table(table) = config else {
            return;
        };
        match parts {
            [] => {},
            [leaf] => {
                let parsed = match table.get(*leaf) {
                    Some(toml::Value::Array(_)) => toml::Value::Array(
                        value
                            .split(',')
                            .map(|item| toml::Value::String(item.trim().to_string()))
                            .collect(),
                    ),
                    Some(toml::Value::String(_)) => toml::Value::String(value.to_string()),
                    _ => Self::parse_env_value(value),
                };
                table.insert((*leaf).to_string(), parsed);
            },
            [head, rest @ ..] => {
                let entry = table
                    .entry((*head).to_string())
                    .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
                Self::set_nested_value(entry, rest, value);
            },
        }
    }

    fn parse_env_value(value: &str) -> toml::Value {
        if let Ok(bool_val) = value.parse::<bool>() {
            return toml::Value::Boolean(bool_val);
        }
        if let Ok(int_val) = value.parse::<i64>() {
            return toml::Value::Integer(int_val);
        }
        toml::Value::String(value.to_string())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_loader_defaults() {
        let loader = ConfigLoader::new();
        assert!(!loader.search_paths().is_empty());
        assert_eq!(loader.env_prefix(), "TRIBUTARY");
    }

    #[test]
    fn test_load_without_file() {
        let dir = TempDir::new().unwrap();
        let config = ConfigLoader::new()
            .with_paths_only(&[dir.path()])
            .load_with_env(Vec::new())
            .unwrap();
        assert_eq!(config, SenderConfig::default());
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("tributary.toml"),
            "max_in_flight = 32\nstop_on_error = false\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_paths_only(&[dir.path()])
            .load_with_env(env(&[
                ("TRIBUTARY_MAX_IN_FLIGHT", "8"),
                ("TRIBUTARY_LOGGING__LEVEL", "debug"),
                ("TRIBUTARY_BOOTSTRAP_SERVERS", "a:9092, b:9093"),
                ("TRIBUTARY_TRANSACTIONAL_ID", "tx-7"),
                ("UNRELATED_MAX_IN_FLIGHT", "1"),
            ]))
            .unwrap();

        assert_eq!(config.max_in_flight, 8);
        assert!(!config.stop_on_error);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.bootstrap_servers, vec!["a:9092", "b:9093"]);
        assert_eq!(config.transactional_id.as_deref(), Some("tx-7"));
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sender.toml");
        std::fs::write(&path, "max_in_flight = 0\n").unwrap();

        assert!(matches!(
            ConfigLoader::load_from_file(&path),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_merge_nested_tables() {
        let base: toml::Value = "[logging]\nlevel = \"info\"\nformat = \"text\"".parse().unwrap();
        let over: toml::Value = "[logging]\nlevel = \"trace\"".parse().unwrap();
        let merged = ConfigLoader::merge_config(base, over);
        assert_eq!(merged["logging"]["level"].as_str(), Some("trace"));
        assert_eq!(merged["logging"]["format"].as_str(), Some("text"));
    }
}
