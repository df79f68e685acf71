use std::sync::Arc;

use futures::future::BoxFuture;

use super::{value_or_zero, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "memory";

const QUERY: &str =
    "SELECT nodename, memorytype, memorymbytes FROM dbe_perf.memory_node_detail";

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(MemoryCollector::new(config)) as Arc<dyn Collector>)
    });
}

/// Per-node memory usage from `dbe_perf.memory_node_detail`.
struct MemoryCollector {
    info: String,
}

impl MemoryCollector {
    fn new(config: &CollectorConfig) -> MemoryCollector {
        MemoryCollector {
            info: format!("{}_{SUBSYSTEM}_info", config.namespace),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let rows = instance.query(QUERY).await?;
        if rows.is_empty() {
            return Err(CollectorError::NoData);
        }
        for row in &rows {
            let nodename = row.get("nodename").unwrap_or_default();
            let memtype = row.get("memorytype").unwrap_or_default();
            sink.gauge(
                &self.info,
                "Memory usage by node and memory type, in megabytes",
                &["nodename", "memtype"],
                &[nodename, memtype],
                value_or_zero(row, "memorymbytes")?,
            )?;
        }
        Ok(())
    }
}

impl Collector for MemoryCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
