//! Connection string helpers.
//!
//! A DSN is either a `postgres://` / `postgresql://` URI or a libpq keyword
//! string (`host=... port=... dbname=...`). Connstring syntax is not parsed
//! in full; the keyword form is only checked superficially.

use url::Url;

use crate::errors::Error;

const PASSWORD_REMOVED: &str = "PASSWORD_REMOVED";
const DEFAULT_PORT: u16 = 5432;

/// Syntactic form of a connection string.
#[derive(Debug, Clone, PartialEq)]
pub enum DsnForm {
    Uri(Url),
    Keyword(String),
}

impl DsnForm {
    /// Classifies `dsn` as URI or keyword form.
    pub fn parse(dsn: &str) -> Result<DsnForm, Error> {
        if dsn.starts_with("postgresql://") || dsn.starts_with("postgres://") {
            return Url::parse(dsn)
                .map(DsnForm::Uri)
                .map_err(|_| Error::InvalidDsn(loggable_dsn(dsn)));
        }
        if is_keyword_connstring(dsn) {
            return Ok(DsnForm::Keyword(dsn.to_string()));
        }
        Err(Error::InvalidDsn(loggable_dsn(dsn)))
    }

    /// Builds a connection string pointing at `database` on the same server.
    ///
    /// URI form replaces the path; keyword form appends an overriding
    /// `dbname=` token since later keywords win in libpq.
    pub fn with_database(&self, database: &str) -> String {
        match self {
            DsnForm::Uri(url) => {
                let mut url = url.clone();
                url.set_path(database);
                url.to_string()
            }
            DsnForm::Keyword(connstring) => {
                format!("{connstring} dbname={}", quote_value(database))
            }
        }
    }

    /// Whether `dsn` is this connection string or one derived from it by
    /// [`DsnForm::with_database`].
    pub fn derives(&self, dsn: &str) -> bool {
        match self {
            DsnForm::Uri(url) => match Url::parse(dsn) {
                Ok(mut other) => {
                    other.set_path(url.path());
                    &other == url
                }
                Err(_) => false,
            },
            DsnForm::Keyword(connstring) => {
                dsn == connstring
                    || dsn
                        .strip_prefix(connstring.as_str())
                        .is_some_and(|rest| rest.starts_with(" dbname="))
            }
        }
    }
}

/// Quotes a keyword-form value the way libpq reads it back: bare when it
/// is a plain token, else single-quoted with `\\` and `'` escaped.
pub fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if plain {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Joins `key=value` pairs into a keyword connstring. Pairs with an empty
/// value are left out so libpq falls back to its default.
pub fn keyword_dsn(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}={}", quote_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Superficial keyword-form check: the string must open with a `key=value`
/// pair (`^ *[a-zA-Z0-9]+ *= *[^= ]+`).
pub fn is_keyword_connstring(dsn: &str) -> bool {
    let rest = dsn.trim_start_matches(' ');
    let key_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    if key_len == 0 {
        return false;
    }
    let rest = rest[key_len..].trim_start_matches(' ');
    let Some(rest) = rest.strip_prefix('=') else {
        return false;
    };
    let rest = rest.trim_start_matches(' ');
    matches!(rest.chars().next(), Some(c) if c != '=' && c != ' ')
}

/// Returns the DSN with its password masked, safe for logs.
pub fn loggable_dsn(dsn: &str) -> String {
    if let Ok(mut url) = Url::parse(dsn) {
        if url.password().is_some() {
            let _ = url.set_password(Some(PASSWORD_REMOVED));
        }
        return url.to_string();
    }
    mask_keyword_password(dsn)
}

/// `host:port` of the server a DSN points at, used as the `server` label.
pub fn server_label(dsn: &str) -> String {
    let config: tokio_postgres::Config = match dsn.parse() {
        Ok(config) => config,
        Err(_) => return "unknown".to_string(),
    };
    let host = match config.get_hosts().first() {
        Some(tokio_postgres::config::Host::Tcp(host)) => host.clone(),
        #[cfg(unix)]
        Some(tokio_postgres::config::Host::Unix(path)) => path.display().to_string(),
        None => "localhost".to_string(),
    };
    let port = config.get_ports().first().copied().unwrap_or(DEFAULT_PORT);
    format!("{host}:{port}")
}

/// Byte spans of `key=value` pairs in a keyword connstring.
struct Pair {
    key: String,
    value_start: usize,
    value_end: usize,
}

fn keyword_pairs(dsn: &str) -> Vec<Pair> {
    let bytes = dsn.as_bytes();
    let mut pairs = Vec::new();
    let mut i = 0;
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let key_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        let key = dsn[key_start..i].to_string();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if key.is_empty() || i >= bytes.len() || bytes[i] != b'=' {
            break;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let value_start = i;
        if i < bytes.len() && bytes[i] == b'\'' {
            i += 1;
            while i < bytes.len() && bytes[i] != b'\'' {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(bytes.len());
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
        }
        pairs.push(Pair {
            key,
            value_start,
            value_end: i,
        });
    }
    pairs
}

fn mask_keyword_password(dsn: &str) -> String {
    let mut masked = String::with_capacity(dsn.len());
    let mut cursor = 0;
    for pair in keyword_pairs(dsn) {
        if pair.key == "password" {
            masked.push_str(&dsn[cursor..pair.value_start]);
            masked.push_str(PASSWORD_REMOVED);
            cursor = pair.value_end;
        }
    }
    masked.push_str(&dsn[cursor..]);
    masked
}
