//! Component registry: the plugin points of the container
//!
//! Every pluggable capability (messaging systems, codecs, storage engines,
//! checkpoint backends, choosers, tasks, listeners, reporters) is resolved
//! by name through this table. Unknown names are setup-fatal; there is no
//! dynamic loading.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use weir_common::checkpoint::CheckpointManagerFactory;
use weir_common::codec::SerdeFactory;
use weir_common::metrics::MetricsReporterFactory;
use weir_common::storage::StorageEngineFactory;
use weir_common::system::SystemFactory;
use weir_common::task::{LifecycleListenerFactory, TaskFactory};

use crate::checkpoint::{FileCheckpointManagerFactory, MemoryCheckpointManagerFactory};
use crate::chooser::{ChooserFactory, RoundRobinChooserFactory};
use crate::reporters::LogReporterFactory;
use crate::serdes::{BytesSerdeFactory, IntegerSerdeFactory, JsonSerdeFactory, StringSerdeFactory};
use crate::storage::MemoryStorageEngineFactory;

#[derive(Default)]
pub struct ComponentRegistry {
    systems: HashMap<String, Arc<dyn SystemFactory>>,
    serdes: HashMap<String, Arc<dyn SerdeFactory>>,
    stores: HashMap<String, Arc<dyn StorageEngineFactory>>,
    checkpoints: HashMap<String, Arc<dyn CheckpointManagerFactory>>,
    choosers: HashMap<String, Arc<dyn ChooserFactory>>,
    tasks: HashMap<String, Arc<dyn TaskFactory>>,
    listeners: HashMap<String, Arc<dyn LifecycleListenerFactory>>,
    reporters: HashMap<String, Arc<dyn MetricsReporterFactory>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with everything the container crate ships:
    /// built-in codecs, the memory storage engine, file/memory checkpoint
    /// backends, the round-robin chooser and the log reporter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_serde_factory("bytes", Arc::new(BytesSerdeFactory));
        registry.register_serde_factory("string", Arc::new(StringSerdeFactory));
        registry.register_serde_factory("integer", Arc::new(IntegerSerdeFactory));
        registry.register_serde_factory("json", Arc::new(JsonSerdeFactory));
        registry.register_store_factory("memory", Arc::new(MemoryStorageEngineFactory));
        registry.register_checkpoint_factory("file", Arc::new(FileCheckpointManagerFactory));
        registry
            .register_checkpoint_factory("memory", Arc::new(MemoryCheckpointManagerFactory::new()));
        registry.register_chooser_factory("round-robin", Arc::new(RoundRobinChooserFactory));
        registry.register_reporter_factory("log", Arc::new(LogReporterFactory));
        registry
    }

    pub fn register_system_factory(&mut self, name: &str, factory: Arc<dyn SystemFactory>) {
        self.systems.insert(name.to_string(), factory);
    }

    pub fn register_serde_factory(&mut self, name: &str, factory: Arc<dyn SerdeFactory>) {
        self.serdes.insert(name.to_string(), factory);
    }

    pub fn register_store_factory(&mut self, name: &str, factory: Arc<dyn StorageEngineFactory>) {
        self.stores.insert(name.to_string(), factory);
    }

    pub fn register_checkpoint_factory(
        &mut self,
        name: &str,
        factory: Arc<dyn CheckpointManagerFactory>,
    ) {
        self.checkpoints.insert(name.to_string(), factory);
    }

    pub fn register_chooser_factory(&mut self, name: &str, factory: Arc<dyn ChooserFactory>) {
        self.choosers.insert(name.to_string(), factory);
    }

    pub fn register_task_factory(&mut self, name: &str, factory: Arc<dyn TaskFactory>) {
        self.tasks.insert(name.to_string(), factory);
    }

    pub fn register_listener_factory(
        &mut self,
        name: &str,
        factory: Arc<dyn LifecycleListenerFactory>,
    ) {
        self.listeners.insert(name.to_string(), factory);
    }

    pub fn register_reporter_factory(
        &mut self,
        name: &str,
        factory: Arc<dyn MetricsReporterFactory>,
    ) {
        self.reporters.insert(name.to_string(), factory);
    }

    pub fn system_factory(&self, name: &str) -> Result<Arc<dyn SystemFactory>> {
        match self.systems.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown system factory '{name}'"),
        }
    }

    pub fn serde_factory(&self, name: &str) -> Result<Arc<dyn SerdeFactory>> {
        match self.serdes.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown serde factory '{name}'"),
        }
    }

    pub fn store_factory(&self, name: &str) -> Result<Arc<dyn StorageEngineFactory>> {
        match self.stores.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown storage engine factory '{name}'"),
        }
    }

    pub fn checkpoint_factory(&self, name: &str) -> Result<Arc<dyn CheckpointManagerFactory>> {
        match self.checkpoints.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown checkpoint factory '{name}'"),
        }
    }

    pub fn chooser_factory(&self, name: &str) -> Result<Arc<dyn ChooserFactory>> {
        match self.choosers.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown chooser factory '{name}'"),
        }
    }

    pub fn task_factory(&self, name: &str) -> Result<Arc<dyn TaskFactory>> {
        match self.tasks.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown task factory '{name}'"),
        }
    }

    pub fn listener_factory(&self, name: &str) -> Result<Arc<dyn LifecycleListenerFactory>> {
        match self.listeners.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown lifecycle listener factory '{name}'"),
        }
    }

    pub fn reporter_factory(&self, name: &str) -> Result<Arc<dyn MetricsReporterFactory>> {
        match self.reporters.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!("unknown metrics reporter factory '{name}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_builtin_names() {
        let registry = ComponentRegistry::with_defaults();
        assert!(registry.serde_factory("json").is_ok());
        assert!(registry.store_factory("memory").is_ok());
        assert!(registry.checkpoint_factory("file").is_ok());
        assert!(registry.chooser_factory("round-robin").is_ok());
        assert!(registry.reporter_factory("log").is_ok());
    }

    #[test]
    fn unknown_names_are_fatal_and_named() {
        let registry = ComponentRegistry::new();
        let error = registry.system_factory("kafka").unwrap_err();
        assert!(error.to_string().contains("kafka"));
    }
}
