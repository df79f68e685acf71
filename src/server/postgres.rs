//! `tokio-postgres` backed sessions.

use futures::future::BoxFuture;
use log::debug;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use super::session::{Connector, QueryRow, Session, SessionError};

/// Connects with the simple query protocol; every value arrives as text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect<'a>(&'a self, dsn: &'a str) -> BoxFuture<'a, Result<Box<dyn Session>, SessionError>> {
        Box::pin(async move {
            let config: tokio_postgres::Config = dsn.parse()?;
            let (client, connection) = config.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    debug!("Database connection closed: {err}");
                }
            });
            Ok(Box::new(PgSession { client }) as Box<dyn Session>)
        })
    }
}

pub struct PgSession {
    client: Client,
}

impl Session for PgSession {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<QueryRow>, SessionError>> {
        Box::pin(async move {
            let messages = self.client.simple_query(sql).await?;
            let mut rows = Vec::new();
            for message in messages {
                if let SimpleQueryMessage::Row(row) = message {
                    let columns = row
                        .columns()
                        .iter()
                        .enumerate()
                        .map(|(index, column)| {
                            (column.name().to_string(), row.get(index).map(String::from))
                        })
                        .collect();
                    rows.push(QueryRow::new(columns));
                }
            }
            Ok(rows)
        })
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}
