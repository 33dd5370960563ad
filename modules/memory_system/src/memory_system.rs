//! In-process messaging system
//!
//! A broker of append-only per-(system, stream, partition) logs with
//! dense integer offsets rendered as decimal strings. Consumers,
//! producers and the admin all share one broker handle, so several
//! containers (or a container and a test) can see the same streams, and
//! distinct systems served by the same broker never share a log even
//! when their stream names collide. Used by the end-to-end tests and the
//! demo configuration; real deployments plug in an external system
//! through the same factory contract.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use config::Config;
use dashmap::DashMap;
use tracing::debug;

use weir_common::metrics::MetricsRegistry;
use weir_common::system::{SystemAdmin, SystemConsumer, SystemFactory, SystemProducer};
use weir_common::{
    Datum, IncomingEnvelope, Offset, OutgoingEnvelope, Partition, SystemStreamPartition,
};

const DEFAULT_POLL_BATCH: usize = 100;

/// One replicated record: raw key and value bytes, value `None` being a
/// tombstone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

#[derive(Default)]
struct Log {
    base: u64,
    records: Vec<StoredRecord>,
}

type LogKey = (String, String, u32);

fn log_key(system: &str, stream: &str, partition: Partition) -> LogKey {
    (system.to_string(), stream.to_string(), partition.0)
}

/// Shared in-process broker
#[derive(Default)]
pub struct MemoryBroker {
    logs: DashMap<LogKey, Log>,
    flushes: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append one record, returning its assigned offset
    pub fn publish(
        &self,
        system: &str,
        stream: &str,
        partition: Partition,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> u64 {
        let mut log = self.logs.entry(log_key(system, stream, partition)).or_default();
        log.records.push(StoredRecord { key, value });
        log.base + log.records.len() as u64 - 1
    }

    /// Pre-populate a log whose first record sits at `base`. Only valid on
    /// an empty log; used to model brokers whose retention already dropped
    /// a prefix.
    pub fn seed(
        &self,
        system: &str,
        stream: &str,
        partition: Partition,
        base: u64,
        records: Vec<StoredRecord>,
    ) -> Result<()> {
        let mut log = self.logs.entry(log_key(system, stream, partition)).or_default();
        if !log.records.is_empty() {
            bail!("log {system}.{stream}/{partition} already has records");
        }
        log.base = base;
        log.records = records;
        Ok(())
    }

    /// All records of one log, oldest first
    pub fn records(&self, system: &str, stream: &str, partition: Partition) -> Vec<StoredRecord> {
        self.logs
            .get(&log_key(system, stream, partition))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, system: &str, stream: &str, partition: Partition) -> usize {
        self.logs
            .get(&log_key(system, stream, partition))
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, system: &str, stream: &str, partition: Partition) -> bool {
        self.len(system, stream, partition) == 0
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn note_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// (oldest, newest, upcoming) offsets of one log
    fn bounds(
        &self,
        system: &str,
        stream: &str,
        partition: Partition,
    ) -> (Option<u64>, Option<u64>, u64) {
        match self.logs.get(&log_key(system, stream, partition)) {
            Some(log) if !log.records.is_empty() => {
                let newest = log.base + log.records.len() as u64 - 1;
                (Some(log.base), Some(newest), newest + 1)
            }
            Some(log) => (None, None, log.base),
            None => (None, None, 0),
        }
    }

    fn read_from(
        &self,
        system: &str,
        stream: &str,
        partition: Partition,
        from: u64,
        max: usize,
    ) -> Vec<(u64, StoredRecord)> {
        let Some(log) = self.logs.get(&log_key(system, stream, partition)) else {
            return Vec::new();
        };
        let start = from.saturating_sub(log.base) as usize;
        log.records
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(index, record)| (log.base + index as u64, record.clone()))
            .collect()
    }
}

fn parse_offset(offset: &Offset) -> Result<u64> {
    offset
        .as_str()
        .parse::<u64>()
        .with_context(|| format!("'{offset}' is not a memory-system offset"))
}

fn raw_bytes(datum: Option<&Datum>, what: &str) -> Result<Option<Vec<u8>>> {
    match datum {
        None => Ok(None),
        Some(Datum::Bytes(bytes)) => Ok(Some(bytes.to_vec())),
        Some(other) => bail!("memory system expects raw {what} bytes, got {other:?}"),
    }
}

pub struct MemorySystemConsumer {
    broker: Arc<MemoryBroker>,
    system: String,
    positions: HashMap<SystemStreamPartition, u64>,
    poll_batch: usize,
}

impl MemorySystemConsumer {
    fn collect(
        &mut self,
        ssps: &HashSet<SystemStreamPartition>,
    ) -> HashMap<SystemStreamPartition, Vec<IncomingEnvelope>> {
        let mut out = HashMap::new();
        for ssp in ssps {
            let Some(position) = self.positions.get_mut(ssp) else {
                continue;
            };
            let batch = self.broker.read_from(
                &self.system,
                ssp.stream(),
                ssp.partition,
                *position,
                self.poll_batch,
            );
            if batch.is_empty() {
                continue;
            }
            *position = batch.last().map(|(offset, _)| offset + 1).unwrap_or(*position);
            let envelopes: Vec<IncomingEnvelope> = batch
                .into_iter()
                .map(|(offset, record)| IncomingEnvelope {
                    ssp: ssp.clone(),
                    offset: Offset::new(offset.to_string()),
                    key: record.key.map(Datum::bytes),
                    value: record.value.map(Datum::bytes),
                })
                .collect();
            out.insert(ssp.clone(), envelopes);
        }
        out
    }
}

#[async_trait]
impl SystemConsumer for MemorySystemConsumer {
    fn register(&mut self, ssp: &SystemStreamPartition, offset: &Offset) -> Result<()> {
        if ssp.system() != self.system {
            bail!("consumer for system '{}' cannot serve {ssp}", self.system);
        }
        let position = parse_offset(offset)?;
        self.positions.insert(ssp.clone(), position);
        debug!("Memory consumer registered {ssp} from offset {position}");
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn poll(
        &mut self,
        ssps: &HashSet<SystemStreamPartition>,
        timeout: Duration,
    ) -> Result<HashMap<SystemStreamPartition, Vec<IncomingEnvelope>>> {
        let collected = self.collect(ssps);
        if !collected.is_empty() || timeout.is_zero() {
            return Ok(collected);
        }
        // Nothing ready: emulate a blocking poll, then look once more.
        tokio::time::sleep(timeout).await;
        Ok(self.collect(ssps))
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct MemorySystemProducer {
    broker: Arc<MemoryBroker>,
    system: String,
    sources: HashSet<String>,
}

#[async_trait]
impl SystemProducer for MemorySystemProducer {
    fn register(&mut self, source: &str) {
        self.sources.insert(source.to_string());
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, source: &str, envelope: OutgoingEnvelope) -> Result<()> {
        if !self.sources.contains(source) {
            bail!("source '{source}' was never registered with the memory producer");
        }
        if envelope.system_stream.system != self.system {
            bail!(
                "producer for system '{}' cannot publish to {}",
                self.system,
                envelope.system_stream
            );
        }
        let partition = envelope.partition.unwrap_or(Partition(0));
        let key = raw_bytes(envelope.key.as_ref(), "key")?;
        let value = raw_bytes(envelope.value.as_ref(), "value")?;
        self.broker.publish(&self.system, &envelope.system_stream.stream, partition, key, value);
        Ok(())
    }

    async fn flush(&mut self, _source: &str) -> Result<()> {
        // Publishes are immediately durable; only the flush itself is
        // observable.
        self.broker.note_flush();
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct MemorySystemAdmin {
    broker: Arc<MemoryBroker>,
    system: String,
}

impl SystemAdmin for MemorySystemAdmin {
    fn oldest_offset(&self, ssp: &SystemStreamPartition) -> Result<Option<Offset>> {
        let (oldest, _, _) = self.broker.bounds(&self.system, ssp.stream(), ssp.partition);
        Ok(oldest.map(|offset| Offset::new(offset.to_string())))
    }

    fn newest_offset(&self, ssp: &SystemStreamPartition) -> Result<Option<Offset>> {
        let (_, newest, _) = self.broker.bounds(&self.system, ssp.stream(), ssp.partition);
        Ok(newest.map(|offset| Offset::new(offset.to_string())))
    }

    fn upcoming_offset(&self, ssp: &SystemStreamPartition) -> Result<Offset> {
        let (_, _, upcoming) = self.broker.bounds(&self.system, ssp.stream(), ssp.partition);
        Ok(Offset::new(upcoming.to_string()))
    }

    fn next_offset(&self, offset: &Offset) -> Result<Offset> {
        Ok(Offset::new((parse_offset(offset)? + 1).to_string()))
    }
}

/// Factory for the `memory` system. All collaborators built by one
/// factory share its broker; each is scoped to the configured system it
/// was built for.
pub struct MemorySystemFactory {
    broker: Arc<MemoryBroker>,
}

impl MemorySystemFactory {
    pub fn new() -> Self {
        Self { broker: MemoryBroker::new() }
    }

    pub fn with_broker(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }
}

impl Default for MemorySystemFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemFactory for MemorySystemFactory {
    fn consumer(
        &self,
        system: &str,
        config: &Config,
        _metrics: &MetricsRegistry,
    ) -> Result<Box<dyn SystemConsumer>> {
        let poll_batch = config
            .get_int(&format!("systems.{system}.poll.batch.size"))
            .map(|size| size.max(1) as usize)
            .unwrap_or(DEFAULT_POLL_BATCH);
        Ok(Box::new(MemorySystemConsumer {
            broker: self.broker.clone(),
            system: system.to_string(),
            positions: HashMap::new(),
            poll_batch,
        }))
    }

    fn producer(
        &self,
        system: &str,
        _config: &Config,
        _metrics: &MetricsRegistry,
    ) -> Result<Box<dyn SystemProducer>> {
        Ok(Box::new(MemorySystemProducer {
            broker: self.broker.clone(),
            system: system.to_string(),
            sources: HashSet::new(),
        }))
    }

    fn admin(&self, system: &str, _config: &Config) -> Result<Box<dyn SystemAdmin>> {
        Ok(Box::new(MemorySystemAdmin {
            broker: self.broker.clone(),
            system: system.to_string(),
        }))
    }
}
