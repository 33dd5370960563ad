//! Fjall-backed storage engine
//!
//! One keyspace per (store, partition) directory with a single data
//! partition inside it. Restores write through the same path as normal
//! puts; `flush` persists the keyspace with a sync.

use std::path::Path;

use anyhow::{Context, Result};
use config::Config;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use tracing::debug;

use weir_common::storage::{RestoreEntry, StorageEngine, StorageEngineFactory};
use weir_common::Partition;

const DATA_PARTITION: &str = "data";

pub struct FjallStorageEngine {
    keyspace: Keyspace,
    data: fjall::Partition,
}

impl FjallStorageEngine {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("creating store dir {}", path.display()))?;
        let keyspace = fjall::Config::new(path).open()?;
        let data = keyspace.open_partition(DATA_PARTITION, PartitionCreateOptions::default())?;
        debug!("Opened fjall store at {}", path.display());
        Ok(Self { keyspace, data })
    }
}

impl StorageEngine for FjallStorageEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key)?.map(|slice| slice.to_vec()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key)?;
        Ok(())
    }

    fn range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.data.range(from.to_vec()..to.to_vec()) {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn flush(&mut self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn restore(&mut self, entries: Vec<RestoreEntry>) -> Result<()> {
        for entry in entries {
            match entry.value {
                Some(value) => self.data.insert(entry.key, value)?,
                None => self.data.remove(entry.key)?,
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

pub struct FjallStorageEngineFactory;

impl StorageEngineFactory for FjallStorageEngineFactory {
    fn build(
        &self,
        _store: &str,
        _partition: Partition,
        path: &Path,
        _config: &Config,
    ) -> Result<Box<dyn StorageEngine>> {
        Ok(Box::new(FjallStorageEngine::open(path)?))
    }
}
