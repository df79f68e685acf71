//! In-memory connector for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::session::{Connector, QueryRow, Session, SessionError};
use super::version::VERSION_QUERY;
use super::DATABASES_QUERY;

type Responder = Arc<dyn Fn(&str) -> Option<Result<Vec<QueryRow>, SessionError>> + Send + Sync>;

struct Shared {
    connects: AtomicUsize,
    open: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    databases: Mutex<Vec<String>>,
    version: Mutex<Result<u32, String>>,
    responder: Mutex<Option<Responder>>,
}

/// Serves canned rows. Every session answers the version, database list
/// and ping queries; anything else returns no rows unless a responder is set.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub(crate) fn new() -> FakeConnector {
        FakeConnector {
            shared: Arc::new(Shared {
                connects: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
                failing: Mutex::new(HashSet::new()),
                databases: Mutex::new(Vec::new()),
                version: Mutex::new(Ok(150_002)),
                responder: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn fail_connect_to(self, dsn: &str) -> FakeConnector {
        self.shared.failing.lock().insert(dsn.to_string());
        self
    }

    pub(crate) fn with_databases(self, databases: &[&str]) -> FakeConnector {
        self.set_databases(databases);
        self
    }

    pub(crate) fn with_version(self, num: u32) -> FakeConnector {
        *self.shared.version.lock() = Ok(num);
        self
    }

    pub(crate) fn with_responder<F>(self, responder: F) -> FakeConnector
    where
        F: Fn(&str) -> Option<Result<Vec<QueryRow>, SessionError>> + Send + Sync + 'static,
    {
        *self.shared.responder.lock() = Some(Arc::new(responder));
        self
    }

    pub(crate) fn set_databases(&self, databases: &[&str]) {
        *self.shared.databases.lock() = databases.iter().map(|db| db.to_string()).collect();
    }

    /// Makes the version query fail on every session.
    pub(crate) fn break_version(&self) {
        *self.shared.version.lock() = Err("version unavailable".to_string());
    }

    pub(crate) fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(&'a self, dsn: &'a str) -> BoxFuture<'a, Result<Box<dyn Session>, SessionError>> {
        Box::pin(async move {
            if self.shared.failing.lock().contains(dsn) {
                return Err(SessionError::Other(format!("connection refused: {dsn}")));
            }
            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            self.shared.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                shared: Arc::clone(&self.shared),
            }) as Box<dyn Session>)
        })
    }
}

struct FakeSession {
    shared: Arc<Shared>,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.shared.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeSession {
    fn answer(&self, sql: &str) -> Result<Vec<QueryRow>, SessionError> {
        let responder = self.shared.responder.lock().clone();
        if let Some(rows) = responder.and_then(|responder| responder(sql)) {
            return rows;
        }
        if sql == VERSION_QUERY {
            let version = self.shared.version.lock().clone();
            return version
                .map(|num| {
                    let num = num.to_string();
                    vec![QueryRow::from_pairs(&[("server_version_num", Some(num.as_str()))])]
                })
                .map_err(SessionError::Other);
        }
        if sql == DATABASES_QUERY {
            return Ok(self
                .shared
                .databases
                .lock()
                .iter()
                .map(|db| QueryRow::from_pairs(&[("datname", Some(db.as_str()))]))
                .collect());
        }
        if sql == "SELECT 1" {
            return Ok(vec![QueryRow::from_pairs(&[("?column?", Some("1"))])]);
        }
        Ok(Vec::new())
    }
}

impl Session for FakeSession {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<QueryRow>, SessionError>> {
        Box::pin(async move { self.answer(sql) })
    }

    fn is_closed(&self) -> bool {
        false
    }
}
