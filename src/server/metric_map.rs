//! Builtin per-server queries, selected by server version.

use log::debug;

use super::session::QueryRow;
use super::version::ServerVersion;
use crate::collector::{MetricSink, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnUsage {
    /// Becomes a label on every sample of the row.
    Label,
    Gauge,
    Counter,
    Discard,
}

#[derive(Debug)]
pub struct ColumnMapping {
    pub name: &'static str,
    pub usage: ColumnUsage,
    pub help: &'static str,
}

const fn label(name: &'static str) -> ColumnMapping {
    ColumnMapping {
        name,
        usage: ColumnUsage::Label,
        help: "",
    }
}

const fn gauge(name: &'static str, help: &'static str) -> ColumnMapping {
    ColumnMapping {
        name,
        usage: ColumnUsage::Gauge,
        help,
    }
}

const fn counter(name: &'static str, help: &'static str) -> ColumnMapping {
    ColumnMapping {
        name,
        usage: ColumnUsage::Counter,
        help,
    }
}

/// A builtin query valid for `min_version <= version < max_version`.
#[derive(Debug)]
pub struct BuiltinQuery {
    pub subsystem: &'static str,
    pub min_version: u32,
    pub max_version: u32,
    /// Server-wide statistics, scraped only through the master entry so that
    /// per-database expansion does not duplicate them.
    pub master_only: bool,
    pub query: &'static str,
    pub columns: &'static [ColumnMapping],
}

impl BuiltinQuery {
    pub fn supports(&self, version: ServerVersion) -> bool {
        (self.min_version..self.max_version).contains(&version.num())
    }

    /// Emits one sample per metric column of every row.
    pub fn emit(
        &self,
        rows: &[QueryRow],
        sink: &MetricSink,
        namespace: &str,
        server: &str,
    ) -> prometheus::Result<()> {
        let mut label_names = vec!["server"];
        label_names.extend(
            self.columns
                .iter()
                .filter(|column| column.usage == ColumnUsage::Label)
                .map(|column| column.name),
        );

        for row in rows {
            let mut label_values = vec![server];
            label_values.extend(
                self.columns
                    .iter()
                    .filter(|column| column.usage == ColumnUsage::Label)
                    .map(|column| row.get(column.name).unwrap_or("")),
            );

            for column in self.columns.iter() {
                let value_type = match column.usage {
                    ColumnUsage::Gauge => ValueType::Gauge,
                    ColumnUsage::Counter => ValueType::Counter,
                    ColumnUsage::Label | ColumnUsage::Discard => continue,
                };
                let value = row.get_f64(column.name).unwrap_or(f64::NAN);
                let name = format!("{namespace}_{}_{}", self.subsystem, column.name);
                sink.record(
                    value_type,
                    &name,
                    column.help,
                    &label_names,
                    &label_values,
                    value,
                )?;
            }
        }
        Ok(())
    }
}

static BUILTIN_QUERIES: &[BuiltinQuery] = &[
    BuiltinQuery {
        subsystem: "stat_database",
        min_version: 0,
        max_version: 120_000,
        master_only: false,
        query: "SELECT datname, numbackends, xact_commit, xact_rollback, \
                blks_read, blks_hit, tup_returned, tup_fetched, tup_inserted, tup_updated, \
                tup_deleted, conflicts, temp_files, temp_bytes, deadlocks \
                FROM pg_stat_database WHERE datname IS NOT NULL",
        columns: &[
            label("datname"),
            gauge("numbackends", "Number of backends currently connected to this database"),
            counter("xact_commit", "Number of transactions in this database that have been committed"),
            counter("xact_rollback", "Number of transactions in this database that have been rolled back"),
            counter("blks_read", "Number of disk blocks read in this database"),
            counter("blks_hit", "Number of times disk blocks were found already in the buffer cache"),
            counter("tup_returned", "Number of rows returned by queries in this database"),
            counter("tup_fetched", "Number of rows fetched by queries in this database"),
            counter("tup_inserted", "Number of rows inserted by queries in this database"),
            counter("tup_updated", "Number of rows updated by queries in this database"),
            counter("tup_deleted", "Number of rows deleted by queries in this database"),
            counter("conflicts", "Number of queries canceled due to conflicts with recovery"),
            counter("temp_files", "Number of temporary files created by queries"),
            counter("temp_bytes", "Total amount of data written to temporary files"),
            counter("deadlocks", "Number of deadlocks detected in this database"),
        ],
    },
    BuiltinQuery {
        subsystem: "stat_database",
        min_version: 120_000,
        max_version: u32::MAX,
        master_only: false,
        query: "SELECT datname, numbackends, xact_commit, xact_rollback, \
                blks_read, blks_hit, tup_returned, tup_fetched, tup_inserted, tup_updated, \
                tup_deleted, conflicts, temp_files, temp_bytes, deadlocks, checksum_failures \
                FROM pg_stat_database WHERE datname IS NOT NULL",
        columns: &[
            label("datname"),
            gauge("numbackends", "Number of backends currently connected to this database"),
            counter("xact_commit", "Number of transactions in this database that have been committed"),
            counter("xact_rollback", "Number of transactions in this database that have been rolled back"),
            counter("blks_read", "Number of disk blocks read in this database"),
            counter("blks_hit", "Number of times disk blocks were found already in the buffer cache"),
            counter("tup_returned", "Number of rows returned by queries in this database"),
            counter("tup_fetched", "Number of rows fetched by queries in this database"),
            counter("tup_inserted", "Number of rows inserted by queries in this database"),
            counter("tup_updated", "Number of rows updated by queries in this database"),
            counter("tup_deleted", "Number of rows deleted by queries in this database"),
            counter("conflicts", "Number of queries canceled due to conflicts with recovery"),
            counter("temp_files", "Number of temporary files created by queries"),
            counter("temp_bytes", "Total amount of data written to temporary files"),
            counter("deadlocks", "Number of deadlocks detected in this database"),
            counter("checksum_failures", "Number of data page checksum failures detected"),
        ],
    },
    BuiltinQuery {
        subsystem: "stat_bgwriter",
        min_version: 0,
        max_version: 170_000,
        master_only: true,
        query: "SELECT checkpoints_timed, checkpoints_req, buffers_checkpoint, \
                buffers_clean, buffers_backend FROM pg_stat_bgwriter",
        columns: &[
            counter("checkpoints_timed", "Number of scheduled checkpoints that have been performed"),
            counter("checkpoints_req", "Number of requested checkpoints that have been performed"),
            counter("buffers_checkpoint", "Number of buffers written during checkpoints"),
            counter("buffers_clean", "Number of buffers written by the background writer"),
            counter("buffers_backend", "Number of buffers written directly by a backend"),
        ],
    },
    BuiltinQuery {
        subsystem: "stat_checkpointer",
        min_version: 170_000,
        max_version: u32::MAX,
        master_only: true,
        query: "SELECT num_timed, num_requested, buffers_written FROM pg_stat_checkpointer",
        columns: &[
            counter("num_timed", "Number of scheduled checkpoints"),
            counter("num_requested", "Number of requested checkpoints"),
            counter("buffers_written", "Number of buffers written during checkpoints"),
        ],
    },
    BuiltinQuery {
        subsystem: "database",
        min_version: 0,
        max_version: u32::MAX,
        master_only: true,
        query: "SELECT datname, pg_database_size(datname) AS size_bytes \
                FROM pg_database WHERE datallowconn",
        columns: &[
            label("datname"),
            gauge("size_bytes", "Disk space used by the database"),
        ],
    },
    BuiltinQuery {
        subsystem: "stat_replication",
        min_version: 0,
        max_version: 100_000,
        master_only: false,
        query: "SELECT application_name, client_addr::text AS client_addr, \
                pg_xlog_location_diff(pg_current_xlog_location(), replay_location) AS lag_bytes \
                FROM pg_stat_replication",
        columns: &[
            label("application_name"),
            label("client_addr"),
            gauge("lag_bytes", "Replay lag of the standby in bytes"),
        ],
    },
    BuiltinQuery {
        subsystem: "stat_replication",
        min_version: 100_000,
        max_version: u32::MAX,
        master_only: false,
        query: "SELECT application_name, client_addr::text AS client_addr, \
                pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn) AS lag_bytes \
                FROM pg_stat_replication",
        columns: &[
            label("application_name"),
            label("client_addr"),
            gauge("lag_bytes", "Replay lag of the standby in bytes"),
        ],
    },
];

/// Queries applicable to one server version.
#[derive(Debug, Default)]
pub struct MetricMap {
    version: Option<ServerVersion>,
    queries: Vec<&'static BuiltinQuery>,
}

impl MetricMap {
    /// Map used before the version is known: nothing to run.
    pub fn empty() -> MetricMap {
        MetricMap::default()
    }

    pub fn for_version(version: ServerVersion) -> MetricMap {
        let queries: Vec<_> = BUILTIN_QUERIES
            .iter()
            .filter(|query| query.supports(version))
            .collect();
        debug!(
            "Built metric map for server version {version}: {} queries",
            queries.len()
        );
        MetricMap {
            version: Some(version),
            queries,
        }
    }

    pub fn version(&self) -> Option<ServerVersion> {
        self.version
    }

    pub fn queries(&self) -> &[&'static BuiltinQuery] {
        &self.queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::sink::render;

    fn subsystems(map: &MetricMap) -> Vec<&'static str> {
        map.queries().iter().map(|query| query.subsystem).collect()
    }

    #[test]
    fn test_stat_database_columns_depend_on_version() {
        let legacy = MetricMap::for_version(ServerVersion::from_num(110_010));
        let current = MetricMap::for_version(ServerVersion::from_num(150_002));
        let checksum = |map: &MetricMap| {
            map.queries()
                .iter()
                .any(|query| query.query.contains("checksum_failures"))
        };
        assert!(!checksum(&legacy));
        assert!(checksum(&current));
    }

    #[test]
    fn test_checkpointer_replaces_bgwriter() {
        let pg16 = subsystems(&MetricMap::for_version(ServerVersion::from_num(160_003)));
        let pg17 = subsystems(&MetricMap::for_version(ServerVersion::from_num(170_000)));
        assert!(pg16.contains(&"stat_bgwriter"));
        assert!(!pg16.contains(&"stat_checkpointer"));
        assert!(pg17.contains(&"stat_checkpointer"));
        assert!(!pg17.contains(&"stat_bgwriter"));
    }

    #[test]
    fn test_one_query_per_subsystem() {
        for num in [90_624, 100_023, 120_005, 150_002, 170_000] {
            let mut names = subsystems(&MetricMap::for_version(ServerVersion::from_num(num)));
            let total = names.len();
            names.dedup();
            assert_eq!(names.len(), total, "duplicate subsystem for {num}");
        }
    }

    #[test]
    fn test_empty_map_has_no_queries() {
        let map = MetricMap::empty();
        assert!(map.queries().is_empty());
        assert!(map.version().is_none());
    }

    #[test]
    fn test_emit_maps_columns() {
        let query = BUILTIN_QUERIES
            .iter()
            .find(|query| query.subsystem == "database")
            .unwrap();
        let rows = vec![QueryRow::from_pairs(&[
            ("datname", Some("orders")),
            ("size_bytes", Some("8192")),
        ])];
        let sink = MetricSink::new();
        query.emit(&rows, &sink, "gs", "db:5432").unwrap();
        let text = render(&sink.gather());
        let line = text
            .lines()
            .find(|line| line.starts_with("gs_database_size_bytes{"))
            .unwrap();
        assert!(line.contains("datname=\"orders\""));
        assert!(line.contains("server=\"db:5432\""));
        assert!(line.ends_with("} 8192"));
    }
}
