//! Connection seam between the scrape engine and the database driver.

use futures::future::BoxFuture;

/// One result row in text form: column name and optional (NULL) value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    columns: Vec<(String, Option<String>)>,
}

impl QueryRow {
    pub fn new(columns: Vec<(String, Option<String>)>) -> QueryRow {
        QueryRow { columns }
    }

    /// Convenience constructor, mostly for canned rows.
    pub fn from_pairs(pairs: &[(&str, Option<&str>)]) -> QueryRow {
        QueryRow {
            columns: pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.map(String::from)))
                .collect(),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    /// Value of column `name`; `None` for NULL or a missing column.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Numeric value of column `name`. Booleans map to 1/0.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(parse_f64)
    }
}

/// Parses a text-protocol value as a sample value.
pub fn parse_f64(value: &str) -> Option<f64> {
    match value {
        "t" | "true" | "on" => Some(1.0),
        "f" | "false" | "off" => Some(0.0),
        other => other.trim().parse::<f64>().ok(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    #[error("{0}")]
    Other(String),
}

/// A live database session. Queries may be issued concurrently.
pub trait Session: Send + Sync + 'static {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<QueryRow>, SessionError>>;

    /// Quickly determines whether the session is unusable.
    fn is_closed(&self) -> bool;
}

/// Opens sessions for a connection string.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, dsn: &'a str) -> BoxFuture<'a, Result<Box<dyn Session>, SessionError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_row_accessors() {
        let row = QueryRow::from_pairs(&[
            ("datname", Some("orders")),
            ("size", Some("1024")),
            ("enabled", Some("t")),
            ("missing", None),
        ]);
        assert_eq!(row.get("datname"), Some("orders"));
        assert_eq!(row.get_f64("size"), Some(1024.0));
        assert_eq!(row.get_f64("enabled"), Some(1.0));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.get("absent"), None);
        assert_eq!(row.get_f64("datname"), None);
        assert_eq!(row.columns().count(), 4);
    }
}
