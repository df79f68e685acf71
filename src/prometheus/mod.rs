//! Prometheus endpoints of the exporter.
//!
//! Database metrics are gathered per request into a fresh sink. Only the
//! exporter's own process metrics live in the long-lived [`REGISTRY`].

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Gauge, GaugeVec, Opts, Registry};

mod server;
mod snapshot;
mod system;

pub use server::{start_prometheus_server, HttpContext};
pub use snapshot::ScrapeSnapshot;

pub(crate) static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static PROCESS_METRICS: OnceCell<ProcessMetrics> = OnceCell::new();

struct ProcessMetrics {
    resident_memory: Gauge,
}

/// Registers the process metrics under `namespace`. Only the first call
/// registers anything; the namespace is fixed for the process lifetime.
pub fn init_process_metrics(namespace: &str) -> prometheus::Result<()> {
    PROCESS_METRICS
        .get_or_try_init(|| {
            let build_info = GaugeVec::new(
                Opts::new(
                    format!("{namespace}_exporter_build_info"),
                    "A metric with a constant '1' value labeled by the version of the exporter.",
                ),
                &["version"],
            )?;
            build_info.with_label_values(&[crate::VERSION]).set(1.0);
            REGISTRY.register(Box::new(build_info))?;

            let resident_memory = Gauge::new(
                format!("{namespace}_exporter_resident_memory_bytes"),
                "Resident memory of the exporter process in bytes.",
            )?;
            REGISTRY.register(Box::new(resident_memory.clone()))?;

            Ok(ProcessMetrics { resident_memory })
        })
        .map(|_| ())
}

/// Refreshes the sampled process metrics before they are served.
pub(crate) fn update_process_metrics() {
    if let Some(metrics) = PROCESS_METRICS.get() {
        if let Some(bytes) = system::resident_memory_bytes() {
            metrics.resident_memory.set(bytes as f64);
        }
    }
}
