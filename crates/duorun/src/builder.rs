//! # Host Builder
//!
//! Collects definitions, extensions and configuration, then validates the lot
//! in one go. Everything that can be wrong about a component set is reported
//! here, before the first session exists.

use std::sync::Arc;

use crate::config::HostConfig;
use crate::context::Environment;
use crate::context::Extensions;
use crate::definition::Definition;
use crate::ledger::Registry;
use crate::runtime::Host;
use crate::runtime::Result;
use crate::store::MemoryStore;
use crate::store::SessionStore;

pub struct HostBuilder {
    config: HostConfig,
    definitions: Vec<Definition>,
    extensions: Extensions,
    store: Option<Arc<dyn SessionStore>>,
}

impl HostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            definitions: Vec::new(),
            extensions: Extensions::new(),
            store: None,
        }
    }

    /// Registration order is the order library hooks run in.
    pub fn register(mut self, definition: Definition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Shares a value with every component through [`crate::Context::extension`].
    pub fn extension<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    /// Replaces the default in-memory session store.
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Host> {
        self.config.validate()?;

        let mut registry = Registry::new();
        for definition in self.definitions {
            registry.register(definition)?;
        }
        registry.validate()?;

        tracing::info!(
            version = %self.config.version,
            components = registry.len(),
            libraries = registry.libraries().count(),
            "host ready"
        );

        let env = Environment {
            registry,
            extensions: self.extensions,
            config: self.config,
        };
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        Ok(Host::from_parts(env, store))
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}
