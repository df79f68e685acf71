//! Long-lived server entries keyed by connection string.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use super::pool::DEFAULT_POOL_SIZE;
use super::session::Connector;
use super::Server;
use crate::dsn::loggable_dsn;
use crate::errors::Error;

/// Shared by every scrape. The first caller for an unseen connection string
/// creates its entry; later callers get the same one.
pub struct ServerCache {
    connector: Arc<dyn Connector>,
    pool_size: usize,
    servers: Mutex<HashMap<String, Arc<Server>>>,
}

impl ServerCache {
    pub fn new(connector: Arc<dyn Connector>) -> ServerCache {
        ServerCache::with_pool_size(connector, DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(connector: Arc<dyn Connector>, pool_size: usize) -> ServerCache {
        ServerCache {
            connector,
            pool_size,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the entry for `dsn`, creating it without connecting.
    pub fn get_or_create(&self, dsn: &str) -> Arc<Server> {
        let mut servers = self.servers.lock();
        if let Some(server) = servers.get(dsn) {
            return Arc::clone(server);
        }
        let server = Arc::new(Server::new(
            dsn,
            Arc::clone(&self.connector),
            self.pool_size,
        ));
        info!("Created server entry for {}", server.label());
        servers.insert(dsn.to_string(), Arc::clone(&server));
        server
    }

    /// Returns a live entry for `dsn`. An entry that fails its ping is
    /// evicted and closed so the next call starts over.
    pub async fn get_server(&self, dsn: &str) -> Result<Arc<Server>, Error> {
        let server = self.get_or_create(dsn);
        match server.ping().await {
            Ok(()) => Ok(server),
            Err(err) => {
                warn!(
                    "Error connecting to {}: {err}, dropping cached entry",
                    loggable_dsn(dsn)
                );
                self.evict(dsn, &server);
                Err(Error::Connect {
                    dsn: loggable_dsn(dsn),
                    source: err,
                })
            }
        }
    }

    fn evict(&self, dsn: &str, server: &Arc<Server>) {
        let removed = {
            let mut servers = self.servers.lock();
            // another caller may already have replaced the entry
            match servers.get(dsn) {
                Some(current) if Arc::ptr_eq(current, server) => servers.remove(dsn),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            removed.close();
        }
    }

    /// Closes and drops every entry whose connection string `keep`
    /// rejects. Returns how many were dropped.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> usize {
        let mut dropped = Vec::new();
        self.servers.lock().retain(|dsn, server| {
            if keep(dsn) {
                return true;
            }
            dropped.push(Arc::clone(server));
            false
        });
        for server in &dropped {
            server.close();
        }
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }

    /// Closes every cached entry exactly once and empties the cache.
    pub fn close(&self) {
        let drained: Vec<_> = self.servers.lock().drain().collect();
        for (_, server) in drained {
            server.close();
        }
    }
}
