use std::sync::Arc;

use log::{error, info, warn};
#[cfg(not(windows))]
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::app::args::Args;
use crate::collector::{CollectorRegistry, PostgresCollector};
use crate::config::{Config, ConfigRepository};
use crate::dsn::DsnForm;
use crate::errors::Error;
use crate::exporter::{Exporter, ExporterOptions};
use crate::prometheus::{init_process_metrics, start_prometheus_server, HttpContext};
use crate::server::{PgConnector, ServerCache};

/// Connection strings scraped by the telemetry endpoint: the ones given on
/// the command line, else every configured instance.
pub fn static_targets(args: &Args, config: &Config) -> Vec<String> {
    if !args.data_source_name.is_empty() {
        return args.data_source_name.clone();
    }
    config.instances.iter().map(|instance| instance.dsn()).collect()
}

pub fn exporter_options(args: &Args) -> ExporterOptions {
    ExporterOptions {
        disable_default_metrics: args.disable_default_metrics,
        disable_settings_metrics: args.disable_settings_metrics,
        auto_discover_databases: args.auto_discover_databases,
        exclude_databases: args.exclude_databases.clone(),
        include_databases: args.include_databases.clone(),
        namespace: args.metric_prefix.clone(),
    }
}

/// Builds the request context around a shared server cache.
pub fn http_context(
    args: &Args,
    config: Arc<ConfigRepository>,
    registry: Arc<CollectorRegistry>,
    servers: Arc<ServerCache>,
) -> HttpContext {
    let dsns = static_targets(args, &config.get());
    let collector = match dsns.first() {
        Some(dsn) => match PostgresCollector::new(&registry, Arc::clone(&servers), dsn, &[]) {
            Ok(collector) => Some(collector),
            Err(err) => {
                error!("Failed to create PostgresCollector: {err}");
                None
            }
        },
        None => {
            warn!("No static target configured, {} serves server metrics only", args.telemetry_path);
            None
        }
    };
    let exporter = Arc::new(Exporter::new(
        dsns,
        exporter_options(args),
        Arc::clone(&servers),
    ));
    HttpContext {
        telemetry_path: args.telemetry_path.clone(),
        registry,
        servers,
        config,
        exporter,
        collector,
    }
}

/// Drops cached entries that no longer belong to a command line target or
/// configured instance, including the per-database entries derived from
/// them. Returns how many were dropped.
pub fn prune_servers(servers: &ServerCache, command_line: &[String], config: &Config) -> usize {
    let forms: Vec<DsnForm> = command_line
        .iter()
        .cloned()
        .chain(config.instances.iter().map(|instance| instance.dsn()))
        .filter_map(|dsn| DsnForm::parse(&dsn).ok())
        .collect();
    servers.retain(|dsn| forms.iter().any(|form| form.derives(dsn)))
}

fn spawn_config_reload(
    config: Arc<ConfigRepository>,
    servers: Arc<ServerCache>,
    command_line: Vec<String>,
) {
    #[cfg(not(windows))]
    tokio::spawn(async move {
        let mut sighup = match unix_signal(SignalKind::hangup()) {
            Ok(sighup) => sighup,
            Err(err) => {
                error!("Failed to setup SIGHUP handler: {err}");
                return;
            }
        };
        loop {
            sighup.recv().await;
            info!("Received SIGHUP, reloading configuration from {}", config.config_path());
            match config.reload() {
                Ok(true) => {
                    info!("Configuration reloaded successfully");
                    let dropped = prune_servers(&servers, &command_line, &config.get());
                    if dropped > 0 {
                        info!("Dropped {dropped} server entries no longer configured");
                    }
                }
                Ok(false) => info!("Configuration unchanged"),
                Err(err) => {
                    error!("Failed to reload configuration: {err}");
                    warn!("Keeping previous configuration");
                }
            }
        }
    });
    #[cfg(windows)]
    drop((config, servers, command_line));
}

/// Serves until Ctrl-C, then releases every cached server entry.
pub async fn run_server(
    args: Args,
    config: Arc<ConfigRepository>,
    registry: Arc<CollectorRegistry>,
) -> Result<(), Error> {
    init_process_metrics(&args.metric_prefix)?;

    let servers = Arc::new(ServerCache::new(Arc::new(PgConnector)));
    let context = Arc::new(http_context(
        &args,
        Arc::clone(&config),
        registry,
        Arc::clone(&servers),
    ));
    // release cached entries on every exit path
    let _release = scopeguard::guard(Arc::clone(&servers), |servers| servers.close());

    spawn_config_reload(
        config,
        Arc::clone(&servers),
        args.data_source_name.clone(),
    );

    let listen_address = args.listen_address.clone();
    let server = start_prometheus_server(&listen_address, context);
    info!("pg_stats_exporter is running. Send SIGHUP to reload configuration, Ctrl+C to stop.");

    tokio::select! {
        result = server => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Got Ctrl+C, shutting down");
        }
    }
    Ok(())
}
