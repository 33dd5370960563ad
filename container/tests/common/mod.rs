//! Shared fixtures for container integration tests: an in-process broker
//! harness, scripted tasks, recording listeners and counting wrappers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use config::Config;

use weir_common::checkpoint::{Checkpoint, CheckpointManager, CheckpointManagerFactory};
use weir_common::metrics::MetricsRegistry;
use weir_common::system::{SystemAdmin, SystemConsumer, SystemFactory, SystemProducer};
use weir_common::task::{
    Collector, Coordinator, LifecycleListenerFactory, StreamTask, TaskContext, TaskFactory,
    TaskLifecycleListener,
};
use weir_common::{
    Datum, IncomingEnvelope, Offset, OutgoingEnvelope, Partition, SystemStream,
    SystemStreamPartition, TaskName,
};
use weir_container::checkpoint::{CheckpointHistory, MemoryCheckpointManagerFactory};
use weir_container::registry::ComponentRegistry;
use weir_module_memory_system::{MemoryBroker, MemorySystemFactory, StoredRecord};

/// One observation a scripted task made
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub ssp: SystemStreamPartition,
    pub offset: Offset,
    pub value: Option<Datum>,
}

pub type Journal = Arc<Mutex<Vec<JournalEntry>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn config(pairs: &[(&str, &str)]) -> Arc<Config> {
    let mut builder = Config::builder();
    for (key, value) in pairs {
        builder = builder.set_override(*key, *value).unwrap();
    }
    Arc::new(builder.build().unwrap())
}

/// Broker + checkpoint history + registry wired to share them
pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub history: CheckpointHistory,
    pub registry: ComponentRegistry,
}

impl Harness {
    pub fn new() -> Self {
        let broker = MemoryBroker::new();
        let history: CheckpointHistory = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ComponentRegistry::with_defaults();
        registry.register_system_factory(
            "memory",
            Arc::new(MemorySystemFactory::with_broker(broker.clone())),
        );
        registry.register_checkpoint_factory(
            "memory",
            Arc::new(MemoryCheckpointManagerFactory::with_history(history.clone())),
        );
        Self { broker, history, registry }
    }

    /// Pre-populate a log with UTF-8 records, first record at `base`
    pub fn seed(
        &self,
        system: &str,
        stream: &str,
        partition: u32,
        base: u64,
        records: &[(Option<&str>, Option<&str>)],
    ) {
        let records = records
            .iter()
            .map(|(key, value)| StoredRecord {
                key: key.map(|key| key.as_bytes().to_vec()),
                value: value.map(|value| value.as_bytes().to_vec()),
            })
            .collect();
        self.broker.seed(system, stream, Partition(partition), base, records).unwrap();
    }

    pub fn checkpoints_for(&self, task: &str) -> Vec<Checkpoint> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.as_str() == task)
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect()
    }

    pub fn last_checkpoint(&self, task: &str) -> Option<Checkpoint> {
        self.checkpoints_for(task).pop()
    }
}

fn push_and_maybe_shutdown(
    journal: &Journal,
    entry: JournalEntry,
    shutdown_after: usize,
    coordinator: &mut Coordinator,
) {
    let observed = {
        let mut journal = journal.lock().unwrap();
        journal.push(entry);
        journal.len()
    };
    if shutdown_after > 0 && observed >= shutdown_after {
        coordinator.request_commit();
        coordinator.request_shutdown();
    }
}

/// Journals every envelope; optionally echoes it to an output stream.
/// Requests commit+shutdown once the shared journal reaches the
/// configured length.
pub struct EchoTask {
    output: Option<SystemStream>,
    journal: Journal,
    shutdown_after: usize,
}

#[async_trait]
impl StreamTask for EchoTask {
    async fn process(
        &mut self,
        envelope: &IncomingEnvelope,
        ctx: &mut TaskContext<'_>,
        collector: &mut Collector,
        coordinator: &mut Coordinator,
    ) -> Result<()> {
        if let Some(output) = &self.output {
            collector.send(
                OutgoingEnvelope::new(
                    output.clone(),
                    envelope.key.clone(),
                    envelope.value.clone(),
                )
                .with_partition(ctx.partition),
            );
        }
        push_and_maybe_shutdown(
            &self.journal,
            JournalEntry {
                ssp: envelope.ssp.clone(),
                offset: envelope.offset.clone(),
                value: envelope.value.clone(),
            },
            self.shutdown_after,
            coordinator,
        );
        Ok(())
    }
}

pub struct EchoTaskFactory {
    pub journal: Journal,
}

impl TaskFactory for EchoTaskFactory {
    fn build(&self, config: &Config) -> Result<Box<dyn StreamTask>> {
        let output = match config.get_string("test.echo.output") {
            Ok(spec) => Some(SystemStream::parse(&spec)?),
            Err(_) => None,
        };
        let shutdown_after = config.get_int("test.shutdown.after").unwrap_or(0).max(0) as usize;
        Ok(Box::new(EchoTask { output, journal: self.journal.clone(), shutdown_after }))
    }
}

/// Puts each envelope's key/value into the `kv` store, reads it back and
/// journals what the store returned
pub struct StoreTask {
    journal: Journal,
    shutdown_after: usize,
}

#[async_trait]
impl StreamTask for StoreTask {
    async fn process(
        &mut self,
        envelope: &IncomingEnvelope,
        ctx: &mut TaskContext<'_>,
        _collector: &mut Collector,
        coordinator: &mut Coordinator,
    ) -> Result<()> {
        let (Some(key), Some(value)) = (envelope.key.clone(), envelope.value.clone()) else {
            bail!("store task expects keyed envelopes");
        };
        let store = ctx.store("kv")?;
        store.put(key.clone(), value).await?;
        let observed = store.get(&key).await?;
        push_and_maybe_shutdown(
            &self.journal,
            JournalEntry {
                ssp: envelope.ssp.clone(),
                offset: envelope.offset.clone(),
                value: observed,
            },
            self.shutdown_after,
            coordinator,
        );
        Ok(())
    }
}

pub struct StoreTaskFactory {
    pub journal: Journal,
}

impl TaskFactory for StoreTaskFactory {
    fn build(&self, config: &Config) -> Result<Box<dyn StreamTask>> {
        let shutdown_after = config.get_int("test.shutdown.after").unwrap_or(0).max(0) as usize;
        Ok(Box::new(StoreTask { journal: self.journal.clone(), shutdown_after }))
    }
}

/// What `init` saw in the `kv` store under key "k"; None means init did
/// not run
pub type ProbeCell = Arc<Mutex<Option<Option<Datum>>>>;

pub fn probe_cell() -> ProbeCell {
    Arc::new(Mutex::new(None))
}

/// Probes the store during init (after restore, before any process call)
/// and shuts down from its first window
pub struct ProbeTask {
    probe: ProbeCell,
}

#[async_trait]
impl StreamTask for ProbeTask {
    async fn init(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let observed = ctx.store("kv")?.get(&Datum::text("k")).await?;
        *self.probe.lock().unwrap() = Some(observed);
        Ok(())
    }

    async fn process(
        &mut self,
        _envelope: &IncomingEnvelope,
        _ctx: &mut TaskContext<'_>,
        _collector: &mut Collector,
        _coordinator: &mut Coordinator,
    ) -> Result<()> {
        Ok(())
    }

    async fn window(
        &mut self,
        _ctx: &mut TaskContext<'_>,
        _collector: &mut Collector,
        coordinator: &mut Coordinator,
    ) -> Result<()> {
        coordinator.request_commit();
        coordinator.request_shutdown();
        Ok(())
    }
}

pub struct ProbeTaskFactory {
    pub probe: ProbeCell,
}

impl TaskFactory for ProbeTaskFactory {
    fn build(&self, _config: &Config) -> Result<Box<dyn StreamTask>> {
        Ok(Box::new(ProbeTask { probe: self.probe.clone() }))
    }
}

/// Journals envelopes, counts windows, and shuts down after a configured
/// number of windows
pub struct TickTask {
    journal: Journal,
    windows: Arc<AtomicU64>,
    shutdown_after_windows: u64,
}

#[async_trait]
impl StreamTask for TickTask {
    async fn process(
        &mut self,
        envelope: &IncomingEnvelope,
        _ctx: &mut TaskContext<'_>,
        _collector: &mut Collector,
        _coordinator: &mut Coordinator,
    ) -> Result<()> {
        self.journal.lock().unwrap().push(JournalEntry {
            ssp: envelope.ssp.clone(),
            offset: envelope.offset.clone(),
            value: envelope.value.clone(),
        });
        Ok(())
    }

    async fn window(
        &mut self,
        _ctx: &mut TaskContext<'_>,
        _collector: &mut Collector,
        coordinator: &mut Coordinator,
    ) -> Result<()> {
        let windows = self.windows.fetch_add(1, Ordering::Relaxed) + 1;
        if windows >= self.shutdown_after_windows {
            coordinator.request_shutdown();
        }
        Ok(())
    }
}

pub struct TickTaskFactory {
    pub journal: Journal,
    pub windows: Arc<AtomicU64>,
}

impl TaskFactory for TickTaskFactory {
    fn build(&self, config: &Config) -> Result<Box<dyn StreamTask>> {
        let shutdown_after_windows =
            config.get_int("test.shutdown.after.windows").unwrap_or(3).max(1) as u64;
        Ok(Box::new(TickTask {
            journal: self.journal.clone(),
            windows: self.windows.clone(),
            shutdown_after_windows,
        }))
    }
}

/// Fails on envelopes whose value is the text "boom"
pub struct FailingTask {
    journal: Journal,
}

#[async_trait]
impl StreamTask for FailingTask {
    async fn process(
        &mut self,
        envelope: &IncomingEnvelope,
        _ctx: &mut TaskContext<'_>,
        _collector: &mut Collector,
        _coordinator: &mut Coordinator,
    ) -> Result<()> {
        if envelope.value == Some(Datum::text("boom")) {
            bail!("boom");
        }
        self.journal.lock().unwrap().push(JournalEntry {
            ssp: envelope.ssp.clone(),
            offset: envelope.offset.clone(),
            value: envelope.value.clone(),
        });
        Ok(())
    }
}

pub struct FailingTaskFactory {
    pub journal: Journal,
}

impl TaskFactory for FailingTaskFactory {
    fn build(&self, _config: &Config) -> Result<Box<dyn StreamTask>> {
        Ok(Box::new(FailingTask { journal: self.journal.clone() }))
    }
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Records every lifecycle transition it observes
pub struct RecordingListener {
    events: EventLog,
}

#[async_trait]
impl TaskLifecycleListener for RecordingListener {
    async fn before_init(&mut self, task: &TaskName) {
        self.events.lock().unwrap().push(format!("before_init:{task}"));
    }

    async fn after_init(&mut self, task: &TaskName) {
        self.events.lock().unwrap().push(format!("after_init:{task}"));
    }

    async fn before_process(&mut self, task: &TaskName, envelope: &IncomingEnvelope) {
        self.events.lock().unwrap().push(format!("before_process:{task}@{}", envelope.offset));
    }

    async fn after_process(&mut self, task: &TaskName, envelope: &IncomingEnvelope) {
        self.events.lock().unwrap().push(format!("after_process:{task}@{}", envelope.offset));
    }

    async fn on_process_failure(
        &mut self,
        task: &TaskName,
        envelope: &IncomingEnvelope,
        _error: &anyhow::Error,
    ) {
        self.events.lock().unwrap().push(format!("failure:{task}@{}", envelope.offset));
    }

    async fn before_close(&mut self, task: &TaskName) {
        self.events.lock().unwrap().push(format!("before_close:{task}"));
    }
}

pub struct RecordingListenerFactory {
    pub events: EventLog,
}

impl LifecycleListenerFactory for RecordingListenerFactory {
    fn build(&self, _name: &str, _config: &Config) -> Result<Box<dyn TaskLifecycleListener>> {
        Ok(Box::new(RecordingListener { events: self.events.clone() }))
    }
}

/// Start/stop counts across every consumer and producer a factory built
#[derive(Clone, Default)]
pub struct LifecycleCounts {
    pub consumer_starts: Arc<AtomicU64>,
    pub consumer_stops: Arc<AtomicU64>,
    pub producer_starts: Arc<AtomicU64>,
    pub producer_stops: Arc<AtomicU64>,
}

impl LifecycleCounts {
    pub fn balanced(&self) -> bool {
        self.consumer_starts.load(Ordering::Relaxed) == self.consumer_stops.load(Ordering::Relaxed)
            && self.producer_starts.load(Ordering::Relaxed)
                == self.producer_stops.load(Ordering::Relaxed)
    }
}

struct CountingConsumer {
    inner: Box<dyn SystemConsumer>,
    counts: LifecycleCounts,
}

#[async_trait]
impl SystemConsumer for CountingConsumer {
    fn register(&mut self, ssp: &SystemStreamPartition, offset: &Offset) -> Result<()> {
        self.inner.register(ssp, offset)
    }

    async fn start(&mut self) -> Result<()> {
        self.counts.consumer_starts.fetch_add(1, Ordering::Relaxed);
        self.inner.start().await
    }

    async fn poll(
        &mut self,
        ssps: &std::collections::HashSet<SystemStreamPartition>,
        timeout: Duration,
    ) -> Result<std::collections::HashMap<SystemStreamPartition, Vec<IncomingEnvelope>>> {
        self.inner.poll(ssps, timeout).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.counts.consumer_stops.fetch_add(1, Ordering::Relaxed);
        self.inner.stop().await
    }
}

struct CountingProducer {
    inner: Box<dyn SystemProducer>,
    counts: LifecycleCounts,
}

#[async_trait]
impl SystemProducer for CountingProducer {
    fn register(&mut self, source: &str) {
        self.inner.register(source);
    }

    async fn start(&mut self) -> Result<()> {
        self.counts.producer_starts.fetch_add(1, Ordering::Relaxed);
        self.inner.start().await
    }

    async fn send(&mut self, source: &str, envelope: OutgoingEnvelope) -> Result<()> {
        self.inner.send(source, envelope).await
    }

    async fn flush(&mut self, source: &str) -> Result<()> {
        self.inner.flush(source).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.counts.producer_stops.fetch_add(1, Ordering::Relaxed);
        self.inner.stop().await
    }
}

/// Memory system factory whose consumers and producers count their own
/// start/stop calls
pub struct CountingSystemFactory {
    inner: MemorySystemFactory,
    pub counts: LifecycleCounts,
}

impl CountingSystemFactory {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            inner: MemorySystemFactory::with_broker(broker),
            counts: LifecycleCounts::default(),
        }
    }
}

impl SystemFactory for CountingSystemFactory {
    fn consumer(
        &self,
        system: &str,
        config: &Config,
        metrics: &MetricsRegistry,
    ) -> Result<Box<dyn SystemConsumer>> {
        Ok(Box::new(CountingConsumer {
            inner: self.inner.consumer(system, config, metrics)?,
            counts: self.counts.clone(),
        }))
    }

    fn producer(
        &self,
        system: &str,
        config: &Config,
        metrics: &MetricsRegistry,
    ) -> Result<Box<dyn SystemProducer>> {
        Ok(Box::new(CountingProducer {
            inner: self.inner.producer(system, config, metrics)?,
            counts: self.counts.clone(),
        }))
    }

    fn admin(&self, system: &str, config: &Config) -> Result<Box<dyn SystemAdmin>> {
        self.inner.admin(system, config)
    }
}

/// Backend whose writes always fail; reads succeed empty
pub struct FailingCheckpointManager;

#[async_trait]
impl CheckpointManager for FailingCheckpointManager {
    fn register(&mut self, _task: &TaskName) {}

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_checkpoint(&mut self, _task: &TaskName, _checkpoint: &Checkpoint) -> Result<()> {
        bail!("checkpoint backend unavailable")
    }

    async fn read_last_checkpoint(&mut self, _task: &TaskName) -> Result<Option<Checkpoint>> {
        Ok(None)
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct FailingCheckpointFactory;

impl CheckpointManagerFactory for FailingCheckpointFactory {
    fn build(&self, _config: &Config) -> Result<Box<dyn CheckpointManager>> {
        Ok(Box::new(FailingCheckpointManager))
    }
}
