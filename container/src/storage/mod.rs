//! Per-task storage: change-logged stores and the restore protocol

mod logged;
mod memory;

pub use logged::LoggedStore;
pub use memory::{MemoryStorageEngine, MemoryStorageEngineFactory};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use weir_common::metrics::{Counter, MetricsRegistry};
use weir_common::storage::{KeyValueStore, RestoreEntry};
use weir_common::system::{SystemAdmin, SystemConsumer};
use weir_common::task::StoreAccess;
use weir_common::{Datum, Partition, SystemStreamPartition, TaskName};

/// A restore of one changelog stream that returned nothing this many polls
/// in a row has stalled; the underlying system is not delivering.
const MAX_IDLE_RESTORE_POLLS: u32 = 20;

/// Everything needed to replay one store's changelog: a dedicated consumer
/// (the shared multiplexer is not running yet, and changelogs are not part
/// of the task's input set) plus the owning system's admin.
pub struct ChangelogRestore {
    pub ssp: SystemStreamPartition,
    pub consumer: Box<dyn SystemConsumer>,
    pub admin: Arc<dyn SystemAdmin>,
}

/// Owns every store of one task partition. Restores change-logged stores
/// before processing begins and hands stores out to the task afterwards.
pub struct TaskStorageManager {
    task_name: TaskName,
    partition: Partition,
    stores: BTreeMap<String, LoggedStore>,
    restores: HashMap<String, ChangelogRestore>,
    poll_interval: Duration,
    restored_entries: Counter,
}

impl TaskStorageManager {
    pub fn new(
        task_name: TaskName,
        partition: Partition,
        poll_interval: Duration,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            task_name,
            partition,
            stores: BTreeMap::new(),
            restores: HashMap::new(),
            poll_interval,
            restored_entries: metrics.counter("storage.restored-entries"),
        }
    }

    pub fn add_store(&mut self, name: &str, store: LoggedStore, restore: Option<ChangelogRestore>) {
        self.stores.insert(name.to_string(), store);
        if let Some(restore) = restore {
            self.restores.insert(name.to_string(), restore);
        }
    }

    pub fn store_names(&self) -> impl Iterator<Item = &String> {
        self.stores.keys()
    }

    /// Replay every changelog into its store. Runs once, before the task
    /// observes any message; failure is fatal for the container.
    pub async fn restore_all(&mut self) -> Result<()> {
        let mut restores: Vec<(String, ChangelogRestore)> = self.restores.drain().collect();
        restores.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, restore) in restores {
            self.restore_store(&name, restore)
                .await
                .with_context(|| format!("restoring store '{name}' for task {}", self.task_name))?;
        }
        Ok(())
    }

    async fn restore_store(&mut self, name: &str, restore: ChangelogRestore) -> Result<()> {
        let ssp = restore.ssp;
        let mut consumer = restore.consumer;

        // An empty changelog restores nothing.
        let Some(newest) = restore.admin.newest_offset(&ssp)? else {
            debug!("Changelog {ssp} is empty, store '{name}' starts fresh");
            return Ok(());
        };
        let Some(oldest) = restore.admin.oldest_offset(&ssp)? else {
            bail!("changelog {ssp} reports a newest offset but no oldest offset");
        };

        consumer.register(&ssp, &oldest)?;
        consumer.start().await?;

        let ssps: HashSet<SystemStreamPartition> = [ssp.clone()].into_iter().collect();
        let mut entries: Vec<RestoreEntry> = Vec::new();
        let mut caught_up = false;
        let mut idle_polls = 0u32;
        while !caught_up {
            let mut polled = consumer.poll(&ssps, self.poll_interval).await?;
            let envelopes = polled.remove(&ssp).unwrap_or_default();
            if envelopes.is_empty() {
                idle_polls += 1;
                if idle_polls > MAX_IDLE_RESTORE_POLLS {
                    bail!("changelog {ssp} stalled before reaching head offset {newest}");
                }
                continue;
            }
            idle_polls = 0;
            for envelope in envelopes {
                caught_up = envelope.offset == newest;
                let key = match envelope.key {
                    Some(Datum::Bytes(bytes)) => bytes.to_vec(),
                    other => bail!(
                        "changelog {ssp} record at offset {} has no raw key: {other:?}",
                        envelope.offset
                    ),
                };
                let value = match envelope.value {
                    Some(Datum::Bytes(bytes)) => Some(bytes.to_vec()),
                    None => None,
                    other => bail!(
                        "changelog {ssp} record at offset {} has a non-raw value: {other:?}",
                        envelope.offset
                    ),
                };
                entries.push(RestoreEntry { key, value });
            }
        }
        consumer.stop().await?;

        let count = entries.len();
        let store = self
            .stores
            .get_mut(name)
            .with_context(|| format!("restore target store '{name}' missing"))?;
        store.restore(entries)?;
        self.restored_entries.add(count as u64);
        info!(
            "Restored store '{name}' for partition {} from {ssp}: {count} entries",
            self.partition
        );
        Ok(())
    }

    /// Flush every store; change-log durability precedes engine durability
    pub async fn flush_all(&mut self) -> Result<()> {
        for (name, store) in self.stores.iter_mut() {
            store.flush().await.with_context(|| format!("flushing store '{name}'"))?;
        }
        Ok(())
    }

    pub fn close_all(&mut self) {
        for (name, store) in self.stores.iter_mut() {
            if let Err(error) = store.close() {
                tracing::error!("Failed to close store '{name}': {error:#}");
            }
        }
    }
}

impl StoreAccess for TaskStorageManager {
    fn store(&mut self, name: &str) -> Option<&mut dyn KeyValueStore> {
        self.stores.get_mut(name).map(|store| store as &mut dyn KeyValueStore)
    }
}
