use std::fmt;

use super::session::{Session, SessionError};

pub const VERSION_QUERY: &str = "SHOW server_version_num";

/// Server version as reported by `server_version_num`, e.g. `150002`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion(u32);

/// Coarse feature level used to pick builtin queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapabilityTier {
    /// Before 10: xlog naming, no `pg_stat_activity.backend_type`.
    Legacy,
    /// 10 through 13.
    Modern,
    /// 14 and later.
    Current,
}

impl ServerVersion {
    pub const fn from_num(num: u32) -> ServerVersion {
        ServerVersion(num)
    }

    pub fn parse(value: &str) -> Option<ServerVersion> {
        value.trim().parse::<u32>().ok().map(ServerVersion)
    }

    pub fn num(&self) -> u32 {
        self.0
    }

    /// Two-part numbering from 10 on, three-part before.
    pub fn major(&self) -> u32 {
        if self.0 >= 100_000 {
            self.0 / 10_000
        } else {
            self.0 / 10_000 * 10 + self.0 / 100 % 100
        }
    }

    pub fn tier(&self) -> CapabilityTier {
        match self.0 {
            0..=99_999 => CapabilityTier::Legacy,
            100_000..=139_999 => CapabilityTier::Modern,
            _ => CapabilityTier::Current,
        }
    }

    /// Asks the server for its version.
    pub async fn query(session: &dyn Session) -> Result<ServerVersion, SessionError> {
        let rows = session.query(VERSION_QUERY).await?;
        let value = rows
            .first()
            .and_then(|row| row.get("server_version_num"))
            .ok_or_else(|| SessionError::Other("empty server_version_num".to_string()))?;
        ServerVersion::parse(value)
            .ok_or_else(|| SessionError::Other(format!("invalid server_version_num {value:?}")))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 100_000 {
            write!(f, "{}.{}", self.0 / 10_000, self.0 % 10_000)
        } else {
            write!(
                f,
                "{}.{}.{}",
                self.0 / 10_000,
                self.0 / 100 % 100,
                self.0 % 100
            )
        }
    }
}
