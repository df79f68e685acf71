use std::sync::Arc;

use futures::future::BoxFuture;
use log::debug;

use super::{value_or_zero, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "stat_activity";

const QUERY: &str = "SELECT pg_database.datname, tmp.state, tmp2.usename, tmp2.application_name, \
    COALESCE(count, 0) AS count, COALESCE(max_tx_duration, 0) AS max_tx_duration \
    FROM (VALUES ('active'), ('idle'), ('idle in transaction'), \
                 ('idle in transaction (aborted)'), ('fastpath function call'), \
                 ('disabled')) AS tmp(state) \
    CROSS JOIN pg_database \
    LEFT JOIN (SELECT datname, state, usename, application_name, count(*) AS count, \
                      MAX(EXTRACT(EPOCH FROM now() - xact_start))::float AS max_tx_duration \
               FROM pg_stat_activity \
               GROUP BY datname, state, usename, application_name) AS tmp2 \
      ON tmp.state = tmp2.state AND pg_database.datname = tmp2.datname \
    WHERE pg_database.datname NOT IN ('template0', 'template1')";

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(StatActivityCollector::new(config)) as Arc<dyn Collector>)
    });
}

/// Backend counts and the longest open transaction per state.
struct StatActivityCollector {
    count: String,
    max_tx_duration: String,
    exclude_databases: Vec<String>,
}

impl StatActivityCollector {
    fn new(config: &CollectorConfig) -> StatActivityCollector {
        let prefix = format!("{}_{SUBSYSTEM}", config.namespace);
        StatActivityCollector {
            count: format!("{prefix}_count"),
            max_tx_duration: format!("{prefix}_max_tx_duration"),
            exclude_databases: config.exclude_databases.clone(),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let rows = instance.query(QUERY).await?;
        if rows.is_empty() {
            return Err(CollectorError::NoData);
        }
        let labels = ["datname", "state", "usename", "application_name"];
        for row in &rows {
            let Some(datname) = row.get("datname") else {
                debug!("Skipping stat_activity row without datname");
                continue;
            };
            // databases nobody is connected to yield NULL users
            let Some(usename) = row.get("usename") else {
                continue;
            };
            if self.exclude_databases.iter().any(|db| db == datname) {
                continue;
            }
            let values = [
                datname,
                row.get("state").unwrap_or_default(),
                usename,
                row.get("application_name").unwrap_or_default(),
            ];
            sink.gauge(
                &self.count,
                "Number of connections in this state",
                &labels,
                &values,
                value_or_zero(row, "count")?,
            )?;
            sink.gauge(
                &self.max_tx_duration,
                "Max duration in seconds any active transaction has been running",
                &labels,
                &values,
                value_or_zero(row, "max_tx_duration")?,
            )?;
        }
        Ok(())
    }
}

impl Collector for StatActivityCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
