//! Errors.

use std::io;

use crate::collector::CollectorError;
use crate::config::ConfigError;
use crate::server::PoolError;

/// Errors surfaced at or above the scrape boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("error opening connection to database ({dsn}): {source}")]
    Connect {
        dsn: String,
        #[source]
        source: PoolError,
    },
    #[error("query failed: {0}")]
    Query(String),
    #[error("unable to parse DSN {0} as either URI or connstring")]
    InvalidDsn(String),
    #[error("empty dsn")]
    EmptyDsn,
    #[error("{failed} of {total} queries failed on {server}")]
    PartialScrape {
        server: String,
        failed: usize,
        total: usize,
    },
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Collector set resolution failures. Construction aborts on any of these.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("missing collector: {0}")]
    Missing(String),
    #[error("disabled collector: {0}")]
    Disabled(String),
    #[error("collector {name} failed to initialize: {source}")]
    Factory {
        name: String,
        #[source]
        source: CollectorError,
    },
}

impl RegistryError {
    /// Name of the collector the error refers to.
    pub fn collector(&self) -> &str {
        match self {
            Self::Missing(name) | Self::Disabled(name) => name,
            Self::Factory { name, .. } => name,
        }
    }
}
