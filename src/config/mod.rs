//! Configuration loading: environment variables or a YAML mapping document
//! (spec.md §4.2).

use crate::consts::{
    DEFAULT_BATCH_CAPACITY_BYTES, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS,
    MAX_BATCH_CAPACITY_BYTES, MIN_BATCH_CAPACITY_BYTES,
};
use crate::error::ConfigError;
use crate::log_warn;
use serde::Deserialize;
use std::env;
use std::path::Path;

const ENV_DATABASE_URL: &str = "HYDRANT_DB_URL";
const ENV_BATCH_SIZE: &str = "HYDRANT_BATCH_SIZE";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub batch_capacity_bytes: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub require_secure_transport: bool,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    database_url: Option<String>,
    batch_capacity_bytes: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    require_secure_transport: Option<bool>,
}

impl Config {
    /// Loads configuration from `source_path` if given, else from environment
    /// variables. Either way, the batch capacity is clamped into
    /// `[MIN_BATCH_CAPACITY_BYTES, MAX_BATCH_CAPACITY_BYTES]` afterward.
    pub fn load(source_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match source_path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        config.clamp_batch_capacity();
        Ok(config)
    }

    fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var(ENV_DATABASE_URL).map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let batch_capacity_bytes = match env::var(ENV_BATCH_SIZE) {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    log_warn!(
                        "{} value {:?} is not a valid integer, using default of {} bytes",
                        ENV_BATCH_SIZE,
                        raw,
                        DEFAULT_BATCH_CAPACITY_BYTES
                    );
                    DEFAULT_BATCH_CAPACITY_BYTES
                }
            },
            Err(_) => DEFAULT_BATCH_CAPACITY_BYTES,
        };

        Ok(Config {
            database_url,
            batch_capacity_bytes,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            require_secure_transport: true,
        })
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let document: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let mapping = document.as_mapping().ok_or(ConfigError::NotAMapping)?;
        let file_config: FileConfig =
            serde_yaml::from_value(serde_yaml::Value::Mapping(mapping.clone()))?;

        let database_url = file_config
            .database_url
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        Ok(Config {
            database_url,
            batch_capacity_bytes: file_config
                .batch_capacity_bytes
                .unwrap_or(DEFAULT_BATCH_CAPACITY_BYTES),
            max_retries: file_config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: file_config
                .retry_delay_ms
                .unwrap_or(DEFAULT_RETRY_DELAY_MS),
            require_secure_transport: file_config.require_secure_transport.unwrap_or(true),
        })
    }

    fn clamp_batch_capacity(&mut self) {
        if self.batch_capacity_bytes < MIN_BATCH_CAPACITY_BYTES {
            log_warn!(
                "batch_capacity_bytes {} below minimum, clamping to {}",
                self.batch_capacity_bytes,
                MIN_BATCH_CAPACITY_BYTES
            );
            self.batch_capacity_bytes = MIN_BATCH_CAPACITY_BYTES;
        } else if self.batch_capacity_bytes > MAX_BATCH_CAPACITY_BYTES {
            log_warn!(
                "batch_capacity_bytes {} above maximum, clamping to {}",
                self.batch_capacity_bytes,
                MAX_BATCH_CAPACITY_BYTES
            );
            self.batch_capacity_bytes = MAX_BATCH_CAPACITY_BYTES;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_missing_database_url_is_an_error() {
        let file = write_yaml("batch_capacity_bytes: 2097152\n");
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseUrl));
    }

    #[test]
    fn file_config_applies_defaults() {
        let file = write_yaml("database_url: postgres://localhost/hydrant\n");
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.database_url, "postgres://localhost/hydrant");
        assert_eq!(config.batch_capacity_bytes, DEFAULT_BATCH_CAPACITY_BYTES);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert!(config.require_secure_transport);
    }

    #[test]
    fn non_mapping_document_is_rejected() {
        let file = write_yaml("- just\n- a\n- list\n");
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::NotAMapping));
    }

    #[test]
    fn batch_capacity_below_minimum_is_clamped() {
        let file = write_yaml(
            "database_url: postgres://localhost/hydrant\nbatch_capacity_bytes: 32768\n",
        );
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.batch_capacity_bytes, MIN_BATCH_CAPACITY_BYTES);
    }

    #[test]
    fn batch_capacity_above_maximum_is_clamped() {
        let file = write_yaml(
            "database_url: postgres://localhost/hydrant\nbatch_capacity_bytes: 33554432\n",
        );
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.batch_capacity_bytes, MAX_BATCH_CAPACITY_BYTES);
    }

    #[test]
    fn unknown_keys_in_file_are_ignored() {
        let file = write_yaml(
            "database_url: postgres://localhost/hydrant\nsome_future_field: true\n",
        );
        assert!(Config::load(Some(file.path())).is_ok());
    }
}
