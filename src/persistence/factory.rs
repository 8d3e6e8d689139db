//! Backend registry
//!
//! Maps a configured backend name to a constructor. The broker builds a
//! registry at startup, registers whatever backends the binary links, and
//! resolves `persistence.backend` once.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::backend::Persistence;
use super::local::{LocalPersistence, StoreSettings};
use crate::config::{Config, ConfigError};

type Constructor = Box<dyn Fn(&Config) -> Result<Arc<dyn Persistence>, ConfigError> + Send + Sync>;

/// Named persistence backend constructors
pub struct PersistenceRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl Default for PersistenceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PersistenceRegistry {
    /// A registry with nothing registered
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// A registry holding the built-in `memory` and `fjall` backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", |config| {
            Ok(Arc::new(LocalPersistence::memory(StoreSettings::from_config(config)))
                as Arc<dyn Persistence>)
        });
        registry.register("fjall", |config| {
            if config.persistence.path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "persistence.path is required for the fjall backend".to_string(),
                ));
            }
            Ok(Arc::new(LocalPersistence::fjall(
                StoreSettings::from_config(config),
                &config.persistence.path,
            )) as Arc<dyn Persistence>)
        });
        registry
    }

    /// Register or replace a backend constructor
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&Config) -> Result<Arc<dyn Persistence>, ConfigError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the backend named by `persistence.backend`. The result is
    /// not yet opened.
    pub fn build(&self, config: &Config) -> Result<Arc<dyn Persistence>, ConfigError> {
        let name = config.persistence.backend.as_str();
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ConfigError::UnknownBackend(name.to_string()))?;
        let backend = constructor(config)?;
        info!(backend = name, "persistence backend selected");
        Ok(backend)
    }
}
