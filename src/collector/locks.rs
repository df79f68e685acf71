use std::sync::Arc;

use futures::future::BoxFuture;

use super::{value_or_zero, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::Instance;

const SUBSYSTEM: &str = "locks";

/// One row per database and lock mode, including modes nobody waits on.
const QUERY: &str = "SELECT pg_database.datname AS datname, tmp.mode AS mode, \
    COALESCE(count, 0) AS count, \
    COALESCE(total_wait_seconds, 0) AS total_wait_seconds, \
    CASE WHEN COALESCE(count, 0) = 0 THEN 0 \
         ELSE COALESCE(total_wait_seconds, 0) / count END AS avg_wait_seconds \
    FROM (VALUES ('accesssharelock'), ('rowsharelock'), ('rowexclusivelock'), \
                 ('shareupdateexclusivelock'), ('sharelock'), ('sharerowexclusivelock'), \
                 ('exclusivelock'), ('accessexclusivelock'), ('sireadlock')) AS tmp(mode) \
    CROSS JOIN pg_database \
    LEFT JOIN (SELECT l.database, lower(l.mode) AS mode, count(*) AS count, \
                      sum(EXTRACT(EPOCH FROM (now() - a.query_start))) AS total_wait_seconds \
               FROM pg_locks l JOIN pg_stat_activity a ON l.pid = a.pid \
               WHERE l.database IS NOT NULL AND NOT l.granted \
               GROUP BY l.database, lower(l.mode)) AS tmp2 \
      ON tmp.mode = tmp2.mode AND pg_database.oid = tmp2.database \
    WHERE datname NOT IN ('template0', 'template1') \
    ORDER BY 1";

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(LocksCollector::new(config)) as Arc<dyn Collector>)
    });
}

/// Ungranted locks per database and mode with their wait times.
struct LocksCollector {
    count: String,
    total_wait: String,
    avg_wait: String,
    exclude_databases: Vec<String>,
}

impl LocksCollector {
    fn new(config: &CollectorConfig) -> LocksCollector {
        let prefix = format!("{}_{SUBSYSTEM}", config.namespace);
        LocksCollector {
            count: format!("{prefix}_count"),
            total_wait: format!("{prefix}_total_wait_seconds"),
            avg_wait: format!("{prefix}_avg_wait_seconds"),
            exclude_databases: config.exclude_databases.clone(),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let rows = instance.query(QUERY).await?;
        if rows.is_empty() {
            return Err(CollectorError::NoData);
        }
        let labels = ["datname", "mode"];
        for row in &rows {
            let (Some(datname), Some(mode)) = (row.get("datname"), row.get("mode")) else {
                continue;
            };
            if self.exclude_databases.iter().any(|db| db == datname) {
                continue;
            }
            let values = [datname, mode];
            sink.gauge(
                &self.count,
                "Number of locks",
                &labels,
                &values,
                value_or_zero(row, "count")?,
            )?;
            sink.gauge(
                &self.total_wait,
                "Total wait time of sessions waiting for a lock",
                &labels,
                &values,
                value_or_zero(row, "total_wait_seconds")?,
            )?;
            sink.gauge(
                &self.avg_wait,
                "Average wait time of sessions waiting for a lock",
                &labels,
                &values,
                value_or_zero(row, "avg_wait_seconds")?,
            )?;
        }
        Ok(())
    }
}

impl Collector for LocksCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
