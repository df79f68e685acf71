use std::sync::Arc;

use futures::future::BoxFuture;
use log::info;

use super::{value_or_zero, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "wait_events";

const QUERY: &str = "SELECT type, event, wait, failed_wait, total_wait_time \
    FROM dbe_perf.wait_events WHERE wait <> 0";

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(WaitEventsCollector::new(config)) as Arc<dyn Collector>)
    });
}

struct WaitEventsCollector {
    wait: String,
    failed_wait: String,
    total_wait_time: String,
}

impl WaitEventsCollector {
    fn new(config: &CollectorConfig) -> WaitEventsCollector {
        let prefix = format!("{}_{SUBSYSTEM}", config.namespace);
        WaitEventsCollector {
            wait: format!("{prefix}_wait"),
            failed_wait: format!("{prefix}_failed_wait"),
            total_wait_time: format!("{prefix}_total_wait_time"),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let rows = instance.query(QUERY).await?;
        if rows.is_empty() {
            return Err(CollectorError::NoData);
        }
        let labels = ["type", "event"];
        for row in &rows {
            let (Some(wait_type), Some(event)) = (row.get("type"), row.get("event")) else {
                info!("Skipping wait event without type or event");
                continue;
            };
            let values = [wait_type, event];
            sink.gauge(
                &self.wait,
                "Number of waits for the event",
                &labels,
                &values,
                value_or_zero(row, "wait")?,
            )?;
            sink.gauge(
                &self.failed_wait,
                "Number of failed waits for the event",
                &labels,
                &values,
                value_or_zero(row, "failed_wait")?,
            )?;
            sink.gauge(
                &self.total_wait_time,
                "Total wait time for the event in microseconds",
                &labels,
                &values,
                value_or_zero(row, "total_wait_time")?,
            )?;
        }
        Ok(())
    }
}

impl Collector for WaitEventsCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
