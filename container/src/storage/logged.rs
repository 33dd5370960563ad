//! A store wrapper that replicates mutations to a changelog stream
//!
//! The change-log write goes through the shared producer multiplexer and
//! precedes the engine apply, so a later commit flush drains it before
//! the checkpoint is written. Stores without a changelog pass straight
//! through to the engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use weir_common::codec::Serde;
use weir_common::metrics::{Counter, MetricsRegistry};
use weir_common::storage::{KeyValueStore, RestoreEntry, StorageEngine};
use weir_common::{Datum, OutgoingEnvelope, SystemStreamPartition};

use crate::producers::SystemProducers;

pub struct LoggedStore {
    name: String,
    engine: Box<dyn StorageEngine>,
    key_serde: Arc<dyn Serde>,
    value_serde: Arc<dyn Serde>,
    changelog: Option<SystemStreamPartition>,
    source: String,
    producers: Arc<Mutex<SystemProducers>>,
    puts: Counter,
    deletes: Counter,
    gets: Counter,
}

impl LoggedStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        engine: Box<dyn StorageEngine>,
        key_serde: Arc<dyn Serde>,
        value_serde: Arc<dyn Serde>,
        changelog: Option<SystemStreamPartition>,
        source: &str,
        producers: Arc<Mutex<SystemProducers>>,
        metrics: &MetricsRegistry,
    ) -> Self {
        let prefix = format!("store.{name}");
        Self {
            puts: metrics.counter(&format!("{prefix}.puts")),
            deletes: metrics.counter(&format!("{prefix}.deletes")),
            gets: metrics.counter(&format!("{prefix}.gets")),
            name,
            engine,
            key_serde,
            value_serde,
            changelog,
            source: source.to_string(),
            producers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replay changelog records straight into the engine, bypassing the
    /// replication path
    pub fn restore(&mut self, entries: Vec<RestoreEntry>) -> Result<()> {
        self.engine.restore(entries)
    }

    pub fn close(&mut self) -> Result<()> {
        self.engine.close()
    }

    async fn log(&self, key: &Datum, value: Option<&Datum>) -> Result<()> {
        let Some(changelog) = &self.changelog else {
            return Ok(());
        };
        let envelope = OutgoingEnvelope::new(
            changelog.system_stream.clone(),
            Some(key.clone()),
            value.cloned(),
        )
        .with_partition(changelog.partition);
        self.producers
            .lock()
            .await
            .send(&self.source, envelope)
            .await
            .with_context(|| format!("replicating store '{}' to {changelog}", self.name))
    }
}

#[async_trait]
impl KeyValueStore for LoggedStore {
    async fn get(&mut self, key: &Datum) -> Result<Option<Datum>> {
        self.gets.inc();
        let key_bytes = self.key_serde.encode(key)?;
        match self.engine.get(&key_bytes)? {
            Some(value_bytes) => Ok(Some(self.value_serde.decode(&value_bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&mut self, key: Datum, value: Datum) -> Result<()> {
        let key_bytes = self.key_serde.encode(&key)?;
        let value_bytes = self.value_serde.encode(&value)?;
        self.log(&key, Some(&value)).await?;
        self.engine.put(&key_bytes, &value_bytes)?;
        self.puts.inc();
        Ok(())
    }

    async fn delete(&mut self, key: &Datum) -> Result<()> {
        let key_bytes = self.key_serde.encode(key)?;
        self.log(key, None).await?;
        self.engine.delete(&key_bytes)?;
        self.deletes.inc();
        Ok(())
    }

    async fn range(&mut self, from: &Datum, to: &Datum) -> Result<Vec<(Datum, Datum)>> {
        let from_bytes = self.key_serde.encode(from)?;
        let to_bytes = self.key_serde.encode(to)?;
        self.engine
            .range(&from_bytes, &to_bytes)?
            .into_iter()
            .map(|(key, value)| {
                Ok((self.key_serde.decode(&key)?, self.value_serde.decode(&value)?))
            })
            .collect()
    }

    async fn flush(&mut self) -> Result<()> {
        if self.changelog.is_some() {
            self.producers.lock().await.flush(&self.source).await?;
        }
        self.engine.flush()
    }
}
