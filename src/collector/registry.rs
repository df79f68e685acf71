use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use super::{Collector, CollectorError, DEFAULT_NAMESPACE};
use crate::errors::RegistryError;

/// Builds a leaf collector from the process-wide collector settings.
pub type Factory =
    Arc<dyn Fn(&CollectorConfig) -> Result<Arc<dyn Collector>, CollectorError> + Send + Sync>;

/// Fixed settings every leaf collector is built with.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub namespace: String,
    /// Databases leaves should leave out of per-database results.
    pub exclude_databases: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> CollectorConfig {
        CollectorConfig {
            namespace: DEFAULT_NAMESPACE.to_string(),
            exclude_databases: Vec::new(),
        }
    }
}

struct Registration {
    default_enabled: bool,
    enabled: Option<bool>,
    factory: Factory,
}

impl Registration {
    fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(self.default_enabled)
    }
}

/// Collects registrations and overrides during startup.
#[derive(Default)]
pub struct CollectorRegistryBuilder {
    registrations: BTreeMap<String, Registration>,
}

impl CollectorRegistryBuilder {
    pub fn new() -> CollectorRegistryBuilder {
        CollectorRegistryBuilder::default()
    }

    /// Registers a collector.
    ///
    /// # Panics
    ///
    /// When `name` is already registered.
    pub fn register<F>(&mut self, name: &str, default_enabled: bool, factory: F) -> &mut Self
    where
        F: Fn(&CollectorConfig) -> Result<Arc<dyn Collector>, CollectorError>
            + Send
            + Sync
            + 'static,
    {
        if self.registrations.contains_key(name) {
            panic!("collector {name} registered twice");
        }
        self.registrations.insert(
            name.to_string(),
            Registration {
                default_enabled,
                enabled: None,
                factory: Arc::new(factory),
            },
        );
        self
    }

    /// Explicit enable/disable switch; takes precedence over the default.
    /// Returns `false` for an unknown name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.registrations.get_mut(name) {
            Some(registration) => {
                registration.enabled = Some(enabled);
                true
            }
            None => false,
        }
    }

    /// Registered names with their defaults, sorted by name.
    pub fn defaults(&self) -> impl Iterator<Item = (&str, bool)> {
        self.registrations
            .iter()
            .map(|(name, registration)| (name.as_str(), registration.default_enabled))
    }

    pub fn build(self, config: CollectorConfig) -> CollectorRegistry {
        for (name, registration) in &self.registrations {
            debug!(
                "Collector {name}: enabled={} (default {})",
                registration.is_enabled(),
                registration.default_enabled
            );
        }
        CollectorRegistry {
            registrations: self
                .registrations
                .into_iter()
                .map(|(name, registration)| {
                    (name, (registration.is_enabled(), registration.factory))
                })
                .collect(),
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }
}

/// Read-only after startup, apart from the cache of instantiated leaves.
pub struct CollectorRegistry {
    registrations: BTreeMap<String, (bool, Factory)>,
    config: CollectorConfig,
    instances: Mutex<HashMap<String, Arc<dyn Collector>>>,
}

impl fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("enabled", &self.enabled_names().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

impl CollectorRegistry {
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// `None` when `name` is not registered.
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.registrations.get(name).map(|(enabled, _)| *enabled)
    }

    pub fn enabled_names(&self) -> impl Iterator<Item = &str> {
        self.registrations
            .iter()
            .filter(|(_, (enabled, _))| *enabled)
            .map(|(name, _)| name.as_str())
    }

    /// Computes the effective collector set.
    ///
    /// With no filters every enabled collector is used. Otherwise each
    /// filter must name a registered, enabled collector; the first one that
    /// does not fails the whole call and nothing is instantiated.
    pub fn resolve(
        &self,
        filters: &[String],
    ) -> Result<Vec<(String, Arc<dyn Collector>)>, RegistryError> {
        let names: BTreeSet<&str> = if filters.is_empty() {
            self.enabled_names().collect()
        } else {
            for name in filters {
                match self.is_enabled(name) {
                    None => return Err(RegistryError::Missing(name.clone())),
                    Some(false) => return Err(RegistryError::Disabled(name.clone())),
                    Some(true) => {}
                }
            }
            filters.iter().map(String::as_str).collect()
        };

        let mut instances = self.instances.lock();
        let mut created = Vec::new();
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let collector = match instances.get(name) {
                Some(collector) => Arc::clone(collector),
                None => {
                    let (_, factory) = &self.registrations[name];
                    let collector =
                        factory(&self.config).map_err(|source| RegistryError::Factory {
                            name: name.to_string(),
                            source,
                        })?;
                    created.push((name.to_string(), Arc::clone(&collector)));
                    collector
                }
            };
            resolved.push((name.to_string(), collector));
        }
        // only cache once the whole set has been built
        for (name, collector) in created {
            info!("Instantiated collector {name}");
            instances.insert(name, collector);
        }
        Ok(resolved)
    }
}
