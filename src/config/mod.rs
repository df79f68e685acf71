//! Configuration: the list of monitored instances, loaded from YAML and
//! swapped atomically on reload.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::dsn::keyword_dsn;
use crate::utils::split_list;

pub const DEFAULT_CONFIG_FILE: &str = "gauss_exporter.yml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error opening config file {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing config file: {0}")]
    Parse(String),
    #[error("invalid instance {0:?}: instance_id must not be empty")]
    EmptyInstanceId(usize),
    #[error("instance_id {0} not found")]
    InstanceNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Days to keep rotated log files.
    #[serde(default)]
    pub max_age: u32,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_log_level(),
            max_age: 0,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One monitored database instance.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetInstance {
    pub instance_id: String,
    /// Comma separated database names.
    #[serde(default)]
    pub exclude_dbs: String,
    /// Connection fields left out fall back to the libpq defaults.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for TargetInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetInstance")
            .field("instance_id", &self.instance_id)
            .field("exclude_dbs", &self.exclude_dbs)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl TargetInstance {
    /// Keyword form connection string for this instance. Empty fields are
    /// omitted.
    pub fn dsn(&self) -> String {
        keyword_dsn(&[
            ("host", self.host.as_str()),
            ("port", self.port.as_str()),
            ("dbname", self.db.as_str()),
            ("user", self.user.as_str()),
            ("password", self.password.as_str()),
            ("sslmode", "disable"),
        ])
    }

    pub fn excluded_databases(&self) -> Vec<String> {
        split_list(&self.exclude_dbs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub instances: Vec<TargetInstance>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Config::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, instance) in self.instances.iter().enumerate() {
            if instance.instance_id.trim().is_empty() {
                return Err(ConfigError::EmptyInstanceId(index));
            }
        }
        Ok(())
    }

    /// Connection string of the first instance whose id equals `id`.
    pub fn resolve_by_identifier(&self, id: &str) -> Result<String, ConfigError> {
        self.find_instance(id)
            .map(TargetInstance::dsn)
            .ok_or_else(|| ConfigError::InstanceNotFound(id.to_string()))
    }

    pub fn find_instance(&self, id: &str) -> Option<&TargetInstance> {
        self.instances
            .iter()
            .find(|instance| instance.instance_id == id)
    }
}

/// Holds the current configuration; readers never block a reload.
pub struct ConfigRepository {
    config: ArcSwap<Config>,
    config_path: String,
}

impl ConfigRepository {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<ConfigRepository, ConfigError> {
        let config = Config::from_file(&path)?;
        Ok(ConfigRepository::with_config(path, config))
    }

    /// Repository starting from `config`; reloads read `path`.
    pub fn with_config<P: AsRef<Path>>(path: P, config: Config) -> ConfigRepository {
        ConfigRepository {
            config: ArcSwap::from_pointee(config),
            config_path: path.as_ref().to_string_lossy().to_string(),
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Re-reads the file. On error the current configuration stays.
    /// Returns whether anything changed.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let new_config = Config::from_file(&self.config_path)?;
        if **self.config.load() == new_config {
            return Ok(false);
        }
        info!(
            "Loaded {} instances from {}",
            new_config.instances.len(),
            self.config_path
        );
        self.config.store(Arc::new(new_config));
        Ok(true)
    }

    pub fn config_path(&self) -> &str {
        &self.config_path
    }
}
