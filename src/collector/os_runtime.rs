use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::{named_value, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "os_runtime";

const QUERY: &str = "SELECT upper(name) AS name, value FROM dbe_perf.os_runtime";

/// Cumulative CPU time per mode, keyed by statistic name.
const CPU_MODES: [(&str, &str); 6] = [
    ("IDLE_TIME", "idle"),
    ("BUSY_TIME", "busy"),
    ("USER_TIME", "user"),
    ("SYS_TIME", "sys"),
    ("IOWAIT_TIME", "iowait"),
    ("NICE_TIME", "nice"),
];

const GAUGES: [(&str, &str, &str); 6] = [
    ("NUM_CPUS", "num_cpus", "Number of CPUs"),
    ("NUM_CPU_CORES", "num_cpu_cores", "Number of CPU cores"),
    ("NUM_CPU_SOCKETS", "num_cpu_sockets", "Number of CPU sockets"),
    ("VM_PAGE_IN_BYTES", "vm_page_in_bytes", "Bytes paged in from swap"),
    ("VM_PAGE_OUT_BYTES", "vm_page_out_bytes", "Bytes paged out to swap"),
    ("LOAD", "load", "Operating system load average"),
];

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(OsRuntimeCollector::new(config)) as Arc<dyn Collector>)
    });
}

/// Host CPU and paging figures from `dbe_perf.os_runtime`.
struct OsRuntimeCollector {
    cpu_seconds: String,
    gauges: Vec<(&'static str, String, &'static str)>,
}

impl OsRuntimeCollector {
    fn new(config: &CollectorConfig) -> OsRuntimeCollector {
        let prefix = format!("{}_{SUBSYSTEM}", config.namespace);
        OsRuntimeCollector {
            cpu_seconds: format!("{prefix}_cpu_seconds_total"),
            gauges: GAUGES
                .iter()
                .map(|(stat, suffix, help)| (*stat, format!("{prefix}_{suffix}"), *help))
                .collect(),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let rows = instance.query(QUERY).await?;
        if rows.is_empty() {
            return Err(CollectorError::NoData);
        }
        let stats: HashMap<&str, _> = rows
            .iter()
            .filter_map(|row| row.get("name").map(|name| (name, row)))
            .collect();

        for (stat, name, help) in &self.gauges {
            sink.gauge(name, help, &[], &[], named_value(&stats, stat)?)?;
        }
        for (stat, mode) in CPU_MODES {
            sink.gauge(
                &self.cpu_seconds,
                "CPU time spent in each mode, as reported by the server",
                &["mode"],
                &[mode],
                named_value(&stats, stat)?,
            )?;
        }
        Ok(())
    }
}

impl Collector for OsRuntimeCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
