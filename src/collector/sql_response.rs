use std::sync::Arc;

use futures::future::BoxFuture;

use super::{value_or_zero, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "sql_response";

const QUERY: &str = "SELECT p80, p95 FROM dbe_perf.statement_responsetime_percentile";

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(SqlResponseCollector::new(config)) as Arc<dyn Collector>)
    });
}

/// Statement response time percentiles.
struct SqlResponseCollector {
    p80: String,
    p95: String,
}

impl SqlResponseCollector {
    fn new(config: &CollectorConfig) -> SqlResponseCollector {
        let prefix = format!("{}_{SUBSYSTEM}", config.namespace);
        SqlResponseCollector {
            p80: format!("{prefix}_p80"),
            p95: format!("{prefix}_p95"),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let rows = instance.query(QUERY).await?;
        let Some(row) = rows.first() else {
            return Err(CollectorError::NoData);
        };
        sink.gauge(
            &self.p80,
            "80% SQL's response time",
            &[],
            &[],
            value_or_zero(row, "p80")?,
        )?;
        sink.gauge(
            &self.p95,
            "95% SQL's response time",
            &[],
            &[],
            value_or_zero(row, "p95")?,
        )?;
        Ok(())
    }
}

impl Collector for SqlResponseCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
