//! Named plugin constructors
//!
//! Each plugin registers default settings; at load time the user's
//! `plugins.config.<name>` table is deep-merged over them and the result
//! handed to the constructor.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::{HookPipeline, Plugin};
use crate::config::{ConfigError, PluginsConfig};

type Constructor = Box<dyn Fn(Value) -> Result<Arc<dyn Plugin>, ConfigError> + Send + Sync>;

struct Entry {
    defaults: Value,
    build: Constructor,
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// any other value in `overlay` replaces the one in `base`.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Plugins available to the broker, by name
#[derive(Default)]
pub struct PluginRegistry {
    entries: BTreeMap<String, Entry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `auth` and `acl` plugins
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::plugins::auth::register(&mut registry);
        crate::plugins::acl::register(&mut registry);
        registry
    }

    /// Register or replace a plugin constructor
    pub fn register<F>(&mut self, name: impl Into<String>, defaults: Value, build: F)
    where
        F: Fn(Value) -> Result<Arc<dyn Plugin>, ConfigError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.into(),
            Entry {
                defaults,
                build: Box::new(build),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Effective settings for `name`: defaults with `user` merged over them
    pub fn settings(&self, name: &str, user: Option<&Value>) -> Result<Value, ConfigError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPlugin(name.to_string()))?;
        let mut merged = entry.defaults.clone();
        if let Some(user) = user {
            merge_json(&mut merged, user.clone());
        }
        Ok(merged)
    }

    /// Build the pipeline for `plugins.order`. Any unknown name or failing
    /// constructor aborts the whole load.
    pub fn load(&self, config: &PluginsConfig) -> Result<HookPipeline, ConfigError> {
        let mut pipeline = HookPipeline::new();
        for name in &config.order {
            let settings = self.settings(name, config.config.get(name))?;
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| ConfigError::UnknownPlugin(name.clone()))?;
            let plugin = (entry.build)(settings)?;
            info!(plugin = %name, "plugin registered in pipeline");
            pipeline.add(plugin);
        }
        Ok(pipeline)
    }
}

/// Decode merged plugin settings, reporting failures against the plugin
pub(crate) fn decode_settings<T: serde::de::DeserializeOwned>(
    name: &str,
    settings: Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(settings).map_err(|e| ConfigError::Plugin {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
