use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::{named_value, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "instance_time";

const QUERY: &str = "SELECT upper(stat_name) AS name, value FROM dbe_perf.instance_time";

const STATS: [&str; 10] = [
    "DB_TIME",
    "CPU_TIME",
    "EXECUTION_TIME",
    "PARSE_TIME",
    "PLAN_TIME",
    "REWRITE_TIME",
    "PL_EXECUTION_TIME",
    "PL_COMPILATION_TIME",
    "NET_SEND_TIME",
    "DATA_IO_TIME",
];

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(InstanceTimeCollector::new(config)) as Arc<dyn Collector>)
    });
}

/// Where the instance spent its time, in microseconds since startup.
struct InstanceTimeCollector {
    metrics: Vec<(&'static str, String)>,
}

impl InstanceTimeCollector {
    fn new(config: &CollectorConfig) -> InstanceTimeCollector {
        let prefix = format!("{}_{SUBSYSTEM}", config.namespace);
        InstanceTimeCollector {
            metrics: STATS
                .iter()
                .map(|stat| (*stat, format!("{prefix}_{}", stat.to_lowercase())))
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
        for (stat, name) in &self.metrics {
            sink.gauge(
                name,
                "Instance time from dbe_perf.instance_time, in microseconds",
                &[],
                &[],
                named_value(&stats, stat)?,
            )?;
        }
        Ok(())
    }
}

impl Collector for InstanceTimeCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
