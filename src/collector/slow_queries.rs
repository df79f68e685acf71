use std::sync::Arc;

use futures::future::BoxFuture;

use super::{value_or_zero, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "query";

/// Non-idle sessions whose current statement has run for over five seconds.
const QUERY: &str = "SELECT count(*) AS count FROM pg_stat_activity \
    WHERE state <> 'idle' AND now() - query_start > interval '5s'";

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(SlowQueryCollector::new(config)) as Arc<dyn Collector>)
    });
}

struct SlowQueryCollector {
    slow_sql_total: String,
}

impl SlowQueryCollector {
    fn new(config: &CollectorConfig) -> SlowQueryCollector {
        SlowQueryCollector {
            slow_sql_total: format!("{}_{SUBSYSTEM}_slow_sql_total", config.namespace),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let rows = instance.query(QUERY).await?;
        let Some(row) = rows.first() else {
            return Err(CollectorError::NoData);
        };
        sink.counter(
            &self.slow_sql_total,
            "Total number of slow sql",
            &[],
            &[],
            value_or_zero(row, "count")?,
        )?;
        Ok(())
    }
}

impl Collector for SlowQueryCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
