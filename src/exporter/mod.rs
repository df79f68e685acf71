//! Server-level scrape path: target discovery and version-dependent
//! builtin metrics for every resolved connection string.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::collector::{MetricSink, DEFAULT_NAMESPACE};
use crate::dsn::{loggable_dsn, DsnForm};
use crate::errors::Error;
use crate::server::{Server, ServerCache};
use crate::utils::clock;

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    pub disable_default_metrics: bool,
    pub disable_settings_metrics: bool,
    pub auto_discover_databases: bool,
    pub exclude_databases: Vec<String>,
    pub include_databases: Vec<String>,
    pub namespace: String,
}

impl Default for ExporterOptions {
    fn default() -> ExporterOptions {
        ExporterOptions {
            disable_default_metrics: false,
            disable_settings_metrics: false,
            auto_discover_databases: false,
            exclude_databases: Vec::new(),
            include_databases: Vec::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// Expands each connection string to itself plus one derived connection
/// string per other database on the same server.
///
/// Unparseable or unreachable connection strings are logged and skipped.
/// The entry of each input connection string is marked as master, so that
/// server-wide statistics are only scraped once per server. The result is
/// deduplicated and unordered.
pub async fn discover_databases(
    servers: &ServerCache,
    dsns: &[String],
    exclude: &[String],
    include: &[String],
) -> Vec<String> {
    let mut discovered = HashSet::new();
    for dsn in dsns {
        let form = match DsnForm::parse(dsn) {
            Ok(form) => form,
            Err(err) => {
                warn!("Skipping DSN: {err}");
                continue;
            }
        };

        let server = match servers.get_server(dsn).await {
            Ok(server) => server,
            Err(err) => {
                error!("Skipping DSN: {err}");
                continue;
            }
        };
        discovered.insert(dsn.clone());
        server.set_master(true);

        let databases = match server.list_databases().await {
            Ok(databases) => databases,
            Err(err) => {
                error!("Error querying databases ({}): {err}", loggable_dsn(dsn));
                continue;
            }
        };
        for database in databases {
            if exclude.contains(&database) {
                continue;
            }
            if !include.is_empty() && !include.contains(&database) {
                continue;
            }
            discovered.insert(form.with_database(&database));
        }
    }
    discovered.into_iter().collect()
}

/// Scrapes server-level metrics for a static or discovered target list.
pub struct Exporter {
    dsns: Vec<String>,
    options: ExporterOptions,
    servers: Arc<ServerCache>,
    scrapes_total: AtomicU64,
}

impl Exporter {
    pub fn new(dsns: Vec<String>, options: ExporterOptions, servers: Arc<ServerCache>) -> Exporter {
        Exporter {
            dsns,
            options,
            servers,
            scrapes_total: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    pub fn servers(&self) -> &Arc<ServerCache> {
        &self.servers
    }

    /// Connection strings to scrape this round.
    pub async fn targets(&self) -> Vec<String> {
        if self.options.auto_discover_databases {
            discover_databases(
                &self.servers,
                &self.dsns,
                &self.options.exclude_databases,
                &self.options.include_databases,
            )
            .await
        } else {
            self.dsns.clone()
        }
    }

    /// Refreshes the version of `server`. Failure is not fatal: the
    /// previous metric map stays in use.
    pub async fn check_map_versions(&self, server: &Server) {
        if let Err(err) = server.refresh_version().await {
            warn!(
                "Proceeding with outdated query maps, as the server version could not be determined: {err}"
            );
        }
    }

    /// Scrapes one connection string.
    pub async fn resolve_one(&self, dsn: &str, sink: &MetricSink) -> Result<(), Error> {
        let server = self.servers.get_server(dsn).await?;
        if !self.options.auto_discover_databases {
            server.set_master(true);
        }
        self.check_map_versions(&server).await;
        server
            .scrape(
                sink,
                &self.options.namespace,
                self.options.disable_settings_metrics,
                self.options.disable_default_metrics,
            )
            .await
    }

    /// Scrapes every target and records the exporter's own health metrics.
    pub async fn scrape(&self, sink: &MetricSink) -> Result<(), Error> {
        let start = clock::now();
        let scrapes = self.scrapes_total.fetch_add(1, Ordering::Relaxed) + 1;

        let dsns = self.targets().await;
        let mut errors = 0;
        let mut connection_errors = 0;
        for dsn in &dsns {
            if let Err(err) = self.resolve_one(dsn, sink).await {
                errors += 1;
                if matches!(err, Error::Connect { .. }) {
                    connection_errors += 1;
                }
                error!("{err}");
            }
        }

        let ns = &self.options.namespace;
        let up = if connection_errors >= dsns.len() { 0.0 } else { 1.0 };
        sink.gauge(
            &format!("{ns}_up"),
            "Whether the last scrape of metrics from the database was able to connect to the server (1 for yes, 0 for no).",
            &[],
            &[],
            up,
        )?;
        sink.gauge(
            &format!("{ns}_exporter_last_scrape_error"),
            "Whether the last scrape of metrics from the database resulted in an error (1 for error, 0 for success).",
            &[],
            &[],
            if errors > 0 { 1.0 } else { 0.0 },
        )?;
        sink.counter(
            &format!("{ns}_exporter_scrapes_total"),
            "Total number of times the database was scraped for metrics.",
            &[],
            &[],
            scrapes as f64,
        )?;
        sink.gauge(
            &format!("{ns}_exporter_last_scrape_duration_seconds"),
            "Duration of the last scrape of metrics from the database.",
            &[],
            &[],
            clock::elapsed(start).as_secs_f64(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
