use std::sync::Arc;

use futures::future::BoxFuture;

use super::{value_or_zero, Collector, CollectorConfig, CollectorError, CollectorRegistryBuilder};
use crate::collector::MetricSink;
use crate::server::{CapabilityTier, Instance};

const SUBSYSTEM: &str = "replication";

// Lag is only meaningful from the primary's point of view.
const LAG_QUERY_LEGACY: &str = "SELECT client_addr::text AS replic_node_addr, \
    CASE WHEN pg_is_in_recovery() THEN 0 \
         ELSE pg_xlog_location_diff(pg_current_xlog_location(), replay_location) END AS lag_bytes \
    FROM pg_stat_replication";

const LAG_QUERY: &str = "SELECT client_addr::text AS replic_node_addr, \
    CASE WHEN pg_is_in_recovery() THEN 0 \
         ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn) END AS lag_bytes \
    FROM pg_stat_replication";

const ROLE_QUERY: &str =
    "SELECT CASE WHEN pg_is_in_recovery() THEN 1 ELSE 0 END AS is_replica";

pub(super) fn register(builder: &mut CollectorRegistryBuilder) {
    builder.register(SUBSYSTEM, true, |config| {
        Ok(Arc::new(ReplicationCollector::new(config)) as Arc<dyn Collector>)
    });
}

/// Standby lag and the replica flag of the scraped node.
struct ReplicationCollector {
    lag: String,
    is_replica: String,
}

impl ReplicationCollector {
    fn new(config: &CollectorConfig) -> ReplicationCollector {
        let prefix = format!("{}_{SUBSYSTEM}", config.namespace);
        ReplicationCollector {
            lag: format!("{prefix}_lag_bytes"),
            is_replica: format!("{prefix}_is_replica"),
        }
    }

    async fn scrape(&self, instance: &Instance, sink: &MetricSink) -> Result<(), CollectorError> {
        let lag_query = match instance.version().await?.tier() {
            CapabilityTier::Legacy => LAG_QUERY_LEGACY,
            CapabilityTier::Modern | CapabilityTier::Current => LAG_QUERY,
        };
        for row in instance.query(lag_query).await? {
            sink.gauge(
                &self.lag,
                "Replication lag behind master in bytes",
                &["replic_node_addr"],
                &[row.get("replic_node_addr").unwrap_or_default()],
                value_or_zero(&row, "lag_bytes")?,
            )?;
        }

        let rows = instance.query(ROLE_QUERY).await?;
        let row = rows.first().ok_or(CollectorError::NoData)?;
        sink.gauge(
            &self.is_replica,
            "Whether the instance is a replica",
            &[],
            &[],
            value_or_zero(row, "is_replica")?,
        )?;
        Ok(())
    }
}

impl Collector for ReplicationCollector {
    fn update<'a>(
        &'a self,
        instance: &'a Instance,
        sink: &'a MetricSink,
    ) -> BoxFuture<'a, Result<(), CollectorError>> {
        Box::pin(self.scrape(instance, sink))
    }
}
