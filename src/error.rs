//! Domain error types, grouped by owning module (spec.md §7).
//!
//! Lower layers (pool, batch, bulk-copy) report failure as `bool`/count pairs
//! per their contracts — never abort the process. `Result` is reserved for
//! paths spec.md treats as genuinely fatal: configuration load and pipeline
//! init.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no database connection string provided")]
    MissingDatabaseUrl,
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("configuration document root is not a mapping")]
    NotAMapping,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no healthy connection available within the acquire deadline")]
    Timeout,
    #[error("pool is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("no healthy connections could be established at startup")]
    NoHealthyConnections,
}
