//! Per-scrape handle derived from a cached [`Server`].

use std::fmt;
use std::sync::Arc;

use log::debug;
use tokio::sync::OnceCell;

use super::pool::{PoolError, PooledSession};
use super::session::QueryRow;
use super::version::ServerVersion;
use super::Server;
use crate::collector::CollectorError;

/// Exclusively owned by one scrape. The session it borrows goes back to the
/// server's pool when the instance is closed or dropped.
pub struct Instance {
    server: Arc<Server>,
    master: bool,
    version: OnceCell<ServerVersion>,
    session: Option<PooledSession>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("server", &self.server.label())
            .field("master", &self.master)
            .field("version", &self.version.get())
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl Instance {
    /// Copies the cached metadata of `server`. No I/O happens until
    /// [`Instance::setup`].
    pub(super) fn new(server: Arc<Server>) -> Instance {
        let master = server.is_master();
        let version = OnceCell::new_with(server.version());
        Instance {
            server,
            master,
            version,
            session: None,
        }
    }

    /// Borrows a session from the server pool. Calling it twice is a no-op.
    pub async fn setup(&mut self) -> Result<(), PoolError> {
        if self.session.is_none() {
            self.session = Some(self.server.pool().get().await?);
        }
        Ok(())
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<QueryRow>, CollectorError> {
        let session = self.session.as_ref().ok_or(CollectorError::NotConnected)?;
        Ok(session.query(sql).await?)
    }

    /// Whether the target is the master node of a discovered set.
    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Server version, fetched on first use when the cache had none.
    pub async fn version(&self) -> Result<ServerVersion, CollectorError> {
        self.version
            .get_or_try_init(|| async {
                let session = self.session.as_ref().ok_or(CollectorError::NotConnected)?;
                Ok::<_, CollectorError>(ServerVersion::query(&**session).await?)
            })
            .await
            .copied()
    }

    /// Returns the borrowed session to the pool.
    pub fn close(mut self) {
        if self.session.take().is_some() {
            debug!("Released session for {}", self.server.label());
        }
    }
}
