//! Concurrent scrape of every selected collector against one target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, log};
use prometheus::core::Desc;

use super::{Collector, CollectorError, CollectorRegistry, MetricSink};
use crate::dsn::loggable_dsn;
use crate::errors::Error;
use crate::server::ServerCache;
use crate::utils::clock;

const DURATION_HELP: &str = "pg_stats_exporter: Duration of a collector scrape.";
const SUCCESS_HELP: &str = "pg_stats_exporter: Whether a collector succeeded.";

/// Drives the selected leaf collectors for one connection string.
pub struct PostgresCollector {
    dsn: String,
    servers: Arc<ServerCache>,
    collectors: Vec<(String, Arc<dyn Collector>)>,
    duration_name: String,
    success_name: String,
    descs: Vec<Desc>,
}

impl PostgresCollector {
    /// Resolves `filters` against `registry`. Fails without side effects on
    /// an empty DSN or an unknown or disabled filter name.
    pub fn new(
        registry: &CollectorRegistry,
        servers: Arc<ServerCache>,
        dsn: &str,
        filters: &[String],
    ) -> Result<PostgresCollector, Error> {
        if dsn.is_empty() {
            return Err(Error::EmptyDsn);
        }
        let collectors = registry.resolve(filters)?;

        let namespace = &registry.config().namespace;
        let duration_name = format!("{namespace}_scrape_collector_duration_seconds");
        let success_name = format!("{namespace}_scrape_collector_success");
        let descs = vec![
            Desc::new(
                duration_name.clone(),
                DURATION_HELP.to_string(),
                vec!["collector".to_string()],
                HashMap::new(),
            )?,
            Desc::new(
                success_name.clone(),
                SUCCESS_HELP.to_string(),
                vec!["collector".to_string()],
                HashMap::new(),
            )?,
        ];

        Ok(PostgresCollector {
            dsn: dsn.to_string(),
            servers,
            collectors,
            duration_name,
            success_name,
            descs,
        })
    }

    /// Descriptors of the two per-collector metadata families.
    pub fn describe(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    pub fn collector_names(&self) -> impl Iterator<Item = &str> {
        self.collectors.iter().map(|(name, _)| name.as_str())
    }

    /// Runs one scrape. Every collector gets its own task; the call returns
    /// once all of them have finished. When no session can be borrowed the
    /// scrape is abandoned and nothing is written to `sink`.
    pub async fn collect(&self, sink: &Arc<MetricSink>) {
        let server = self.servers.get_or_create(&self.dsn);
        let mut instance = server.instance();
        if let Err(err) = instance.setup().await {
            error!(
                "Error opening connection to database ({}): {err}",
                loggable_dsn(&self.dsn)
            );
            return;
        }
        let instance = Arc::new(instance);

        let handles: Vec<_> = self
            .collectors
            .iter()
            .map(|(name, collector)| {
                let collector = Arc::clone(collector);
                let instance = Arc::clone(&instance);
                let sink = Arc::clone(sink);
                let spawned = clock::now();
                let handle = tokio::spawn(async move {
                    let start = clock::now();
                    let result = collector.update(&instance, &sink).await;
                    (result, clock::elapsed(start))
                });
                (name.as_str(), spawned, handle)
            })
            .collect();

        for (name, spawned, handle) in handles {
            let (success, elapsed) = match handle.await {
                Ok((result, elapsed)) => {
                    log_outcome(name, elapsed, &result);
                    (result.is_ok(), elapsed)
                }
                Err(err) => {
                    error!("collector {name} panicked: {err}");
                    (false, clock::elapsed(spawned))
                }
            };
            self.record(sink, name, elapsed, success);
        }

        // every task has finished, so this is the last reference
        match Arc::try_unwrap(instance) {
            Ok(instance) => instance.close(),
            Err(_) => debug!("Instance still referenced after scrape, released on drop"),
        }
    }

    fn record(&self, sink: &MetricSink, name: &str, elapsed: Duration, success: bool) {
        let result = sink
            .gauge(
                &self.duration_name,
                DURATION_HELP,
                &["collector"],
                &[name],
                elapsed.as_secs_f64(),
            )
            .and_then(|()| {
                sink.gauge(
                    &self.success_name,
                    SUCCESS_HELP,
                    &["collector"],
                    &[name],
                    if success { 1.0 } else { 0.0 },
                )
            });
        if let Err(err) = result {
            error!("Failed to record scrape metadata for {name}: {err}");
        }
    }
}

fn log_outcome(name: &str, elapsed: Duration, result: &Result<(), CollectorError>) {
    let seconds = elapsed.as_secs_f64();
    match result {
        Ok(()) => debug!("collector {name} succeeded in {seconds:.6}s"),
        Err(err) if err.is_no_data() => {
            log!(err.log_level(), "collector {name} returned no data in {seconds:.6}s")
        }
        Err(err) => log!(
            err.log_level(),
            "collector {name} failed after {seconds:.6}s: {err}"
        ),
    }
}
