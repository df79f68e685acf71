//! `crate::server` module (cached per-target entries and their connections).

mod cache;
mod instance;
pub mod metric_map;
mod pool;
mod postgres;
mod session;
pub mod settings;
mod version;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::RwLock;

pub use cache::ServerCache;
pub use instance::Instance;
pub use metric_map::MetricMap;
pub use pool::{Pool, PoolError, PoolStatus, PooledSession, DEFAULT_POOL_SIZE};
pub use postgres::{PgConnector, PgSession};
pub use session::{parse_f64, Connector, QueryRow, Session, SessionError};
pub use version::{CapabilityTier, ServerVersion, VERSION_QUERY};

use crate::collector::MetricSink;
use crate::dsn::server_label;
use crate::errors::Error;

/// Databases reachable through the same server, excluding the one the
/// connection string already points at.
pub const DATABASES_QUERY: &str = "SELECT datname FROM pg_database \
    WHERE datallowconn = true AND datistemplate = false AND datname != current_database()";

struct ServerState {
    master: bool,
    version: Option<ServerVersion>,
    metric_map: Arc<MetricMap>,
}

/// Long-lived state for one connection string: its session pool and the
/// last known version metadata.
pub struct Server {
    dsn: String,
    label: String,
    pool: Pool,
    state: RwLock<ServerState>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Server")
            .field("label", &self.label)
            .field("master", &state.master)
            .field("version", &state.version)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Server {
    pub(crate) fn new(dsn: &str, connector: Arc<dyn Connector>, pool_size: usize) -> Server {
        Server {
            dsn: dsn.to_string(),
            label: server_label(dsn),
            pool: Pool::new(dsn, connector, pool_size),
            state: RwLock::new(ServerState {
                master: false,
                version: None,
                metric_map: Arc::new(MetricMap::empty()),
            }),
        }
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// `host:port`, used as the `server` label.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn is_master(&self) -> bool {
        self.state.read().master
    }

    pub fn set_master(&self, master: bool) {
        self.state.write().master = master;
    }

    pub fn version(&self) -> Option<ServerVersion> {
        self.state.read().version
    }

    pub fn metric_map(&self) -> Arc<MetricMap> {
        Arc::clone(&self.state.read().metric_map)
    }

    /// Derives a fresh per-scrape handle.
    pub fn instance(self: &Arc<Self>) -> Instance {
        Instance::new(Arc::clone(self))
    }

    /// Checks that a session can be opened and answers.
    pub async fn ping(&self) -> Result<(), PoolError> {
        let session = self.pool.get().await?;
        session.query("SELECT 1").await?;
        Ok(())
    }

    /// Re-reads the server version, rebuilding the metric map only when the
    /// version changed.
    pub async fn refresh_version(&self) -> Result<ServerVersion, Error> {
        let session = self.pool.get().await?;
        let version = ServerVersion::query(&*session)
            .await
            .map_err(|err| Error::Query(format!("{}: {err}", self.label)))?;
        drop(session);

        let mut state = self.state.write();
        if state.version != Some(version) {
            if let Some(previous) = state.version {
                info!(
                    "Server version of {} changed from {previous} to {version}",
                    self.label
                );
            }
            state.version = Some(version);
            state.metric_map = Arc::new(MetricMap::for_version(version));
        }
        Ok(version)
    }

    /// Names of the other databases that accept connections.
    pub async fn list_databases(&self) -> Result<Vec<String>, Error> {
        let session = self.pool.get().await?;
        let rows = session
            .query(DATABASES_QUERY)
            .await
            .map_err(|err| Error::Query(format!("{}: {err}", self.label)))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("datname"))
            .map(String::from)
            .collect())
    }

    /// Emits version-dependent server metrics. Failed queries are logged and
    /// skipped; the first failure does not stop the rest.
    pub async fn scrape(
        &self,
        sink: &MetricSink,
        namespace: &str,
        disable_settings: bool,
        disable_default: bool,
    ) -> Result<(), Error> {
        let (version, map, master) = {
            let state = self.state.read();
            (state.version, Arc::clone(&state.metric_map), state.master)
        };

        if let Some(version) = version {
            let num = version.num().to_string();
            let short = version.to_string();
            sink.gauge(
                &format!("{namespace}_static"),
                "Version string as reported by the server",
                &["server", "version", "short_version"],
                &[self.label.as_str(), num.as_str(), short.as_str()],
                1.0,
            )?;
        }

        let session = self.pool.get().await?;
        let mut total = 0;
        let mut failed = 0;

        if !disable_default {
            for query in map.queries() {
                if query.master_only && !master {
                    continue;
                }
                total += 1;
                let result = match session.query(query.query).await {
                    Ok(rows) => query
                        .emit(&rows, sink, namespace, &self.label)
                        .map_err(|err| err.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                if let Err(err) = result {
                    failed += 1;
                    error!(
                        "Failed to collect {} on {}: {err}",
                        query.subsystem, self.label
                    );
                }
            }
        }

        if !disable_settings {
            total += 1;
            let result = match session.query(settings::SETTINGS_QUERY).await {
                Ok(rows) => settings::emit(&rows, sink, namespace, &self.label)
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            if let Err(err) = result {
                failed += 1;
                error!("Failed to collect settings on {}: {err}", self.label);
            }
        }

        debug!("Scraped {total} queries on {} ({failed} failed)", self.label);
        if failed > 0 {
            return Err(Error::PartialScrape {
                server: self.label.clone(),
                failed,
                total,
            });
        }
        Ok(())
    }

    /// Closes the pool. Sessions still borrowed are dropped when returned.
    pub fn close(&self) {
        if !self.pool.is_closed() {
            info!("Closing connection pool of {}", self.label);
        }
        self.pool.close();
    }
}
