use std::process;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::runtime::Builder;

use pg_stats_exporter::app::{self, init_logging, run_server};
use pg_stats_exporter::collector::{register_builtin, CollectorConfig, CollectorRegistryBuilder};
use pg_stats_exporter::config::{Config, ConfigRepository};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    let mut builder = CollectorRegistryBuilder::new();
    register_builtin(&mut builder);

    let args = app::parse(builder.defaults());

    let (config, config_error) = match ConfigRepository::new(&args.config_file) {
        Ok(config) => (config, None),
        Err(err) => (
            ConfigRepository::with_config(&args.config_file, Config::default()),
            Some(err),
        ),
    };

    if let Err(err) = init_logging(&args, &config.get()) {
        eprintln!("Failed to initialize logging: {err}");
        process::exit(exitcode::CONFIG);
    }
    if let Some(err) = config_error {
        warn!("Running without configured instances: {err}");
    }

    for (name, enabled) in &args.collector_overrides {
        builder.set_enabled(name, *enabled);
    }
    let registry = Arc::new(builder.build(CollectorConfig {
        namespace: args.metric_prefix.clone(),
        exclude_databases: args.exclude_databases.clone(),
    }));
    info!(
        "Enabled collectors: {}",
        registry.enabled_names().collect::<Vec<_>>().join(", ")
    );

    let runtime = match Builder::new_multi_thread()
        .enable_all()
        .thread_name("worker-pg-stats")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to build tokio runtime: {err}");
            process::exit(exitcode::OSERR);
        }
    };

    if let Err(err) = runtime.block_on(run_server(args, Arc::new(config), registry)) {
        error!("{err}");
        process::exit(exitcode::SOFTWARE);
    }
}
