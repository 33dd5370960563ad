//! In-memory storage engine over a BTreeMap

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use config::Config;

use weir_common::storage::{RestoreEntry, StorageEngine, StorageEngineFactory};
use weir_common::Partition;

#[derive(Default)]
pub struct MemoryStorageEngine {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryStorageEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .entries
            .range(from.to_vec()..to.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn restore(&mut self, entries: Vec<RestoreEntry>) -> Result<()> {
        for entry in entries {
            match entry.value {
                Some(value) => self.entries.insert(entry.key, value),
                None => self.entries.remove(&entry.key),
            };
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryStorageEngineFactory;

impl StorageEngineFactory for MemoryStorageEngineFactory {
    fn build(
        &self,
        _store: &str,
        _partition: Partition,
        _path: &Path,
        _config: &Config,
    ) -> Result<Box<dyn StorageEngine>> {
        Ok(Box::new(MemoryStorageEngine::new()))
    }
}
