//! `crate::collector` module (pluggable per-target metric collectors).
//!
//! A leaf collector issues one or two queries against an [`Instance`] and
//! writes samples into a [`MetricSink`]. Leaves are registered explicitly at
//! startup into a [`CollectorRegistryBuilder`]; the resulting
//! [`CollectorRegistry`] instantiates each leaf at most once and hands the
//! same object to every target's [`PostgresCollector`].

mod aggregate;
mod instance_time;
mod locks;
mod memory;
mod os_runtime;
mod registry;
mod replication;
pub mod sink;
mod slow_queries;
mod sql_response;
mod stat_activity;
mod wait_events;

use std::collections::HashMap;

use futures::future::BoxFuture;
use log::Level;

pub use aggregate::PostgresCollector;
pub use registry::{CollectorConfig, CollectorRegistry, CollectorRegistryBuilder, Factory};
pub use sink::{MetricSink, ValueType};

use crate::server::{Instance, SessionError};

/// Default prefix for every exported metric name.
pub const DEFAULT_NAMESPACE: &str = "gs";

/// Outcome of a failed [`Collector::update`].
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Nothing to report. Benign, but still scored as an unsuccessful scrape.
    #[error("collector returned no data")]
    NoData,
    #[error(transparent)]
    Query(#[from] SessionError),
    #[error("unexpected value in column {column}: {value:?}")]
    Parse { column: String, value: String },
    #[error("instance is not connected")]
    NotConnected,
    #[error(transparent)]
    Metric(#[from] prometheus::Error),
    #[error("{0}")]
    Init(String),
}

impl CollectorError {
    pub fn is_no_data(&self) -> bool {
        matches!(self, CollectorError::NoData)
    }

    /// Severity a failure of this kind is logged with.
    pub fn log_level(&self) -> Level {
        if self.is_no_data() {
            Level::Debug
        } else {
            Level::Error
        }
    }
}

/// One metric capability. Implementations hold no per-target state: the
/// same object serves every target concurrently.
pub trait Collector: Send + Sync + 'static {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>>;
}

/// Registers every builtin leaf collector.
pub fn register_builtin(builder: &mut CollectorRegistryBuilder) {
    memory::register(builder);
    locks::register(builder);
    replication::register(builder);
    stat_activity::register(builder);
    wait_events::register(builder);
    os_runtime::register(builder);
    instance_time::register(builder);
    sql_response::register(builder);
    slow_queries::register(builder);
}

/// Reads a numeric column, treating NULL as zero.
fn value_or_zero(row: &crate::server::QueryRow, column: &str) -> Result<f64, CollectorError> {
    match row.get(column) {
        None => Ok(0.0),
        Some(value) => crate::server::parse_f64(value).ok_or_else(|| CollectorError::Parse {
            column: column.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Value of the `name`/`value` row for `stat`, zero when the server does
/// not report it.
fn named_value(
    stats: &HashMap<&str, &crate::server::QueryRow>,
    stat: &str,
) -> Result<f64, CollectorError> {
    match stats.get(stat) {
        Some(row) => value_or_zero(row, "value"),
        None => Ok(0.0),
    }
}
