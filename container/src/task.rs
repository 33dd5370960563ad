//! One partition's binding of user task logic to the container
//!
//! A task instance owns its user task, stores, collector, listeners and
//! offset table, and shares the producer multiplexer and checkpoint
//! manager with the rest of the container. All of its methods run on the
//! single container thread.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use weir_common::checkpoint::{Checkpoint, CheckpointManager};
use weir_common::config::{OffsetDefault, StreamConfig, TaskConfig};
use weir_common::metrics::{Counter, MetricsRegistry};
use weir_common::system::SystemAdmin;
use weir_common::task::{Collector, Coordinator, StreamTask, TaskContext, TaskLifecycleListener};
use weir_common::{IncomingEnvelope, Offset, Partition, SystemStreamPartition, TaskName};

use crate::consumers::SystemConsumers;
use crate::producers::SystemProducers;
use crate::serdes::SerdeManager;
use crate::storage::TaskStorageManager;

pub struct TaskInstance {
    task_name: TaskName,
    partition: Partition,
    task: Box<dyn StreamTask>,
    input_ssps: HashSet<SystemStreamPartition>,
    storage: TaskStorageManager,
    producers: Arc<Mutex<SystemProducers>>,
    serdes: Arc<SerdeManager>,
    checkpoints: Option<Arc<Mutex<Box<dyn CheckpointManager>>>>,
    listeners: Vec<Box<dyn TaskLifecycleListener>>,
    collector: Collector,
    /// Last processed offset per input SSP (inclusive)
    offsets: BTreeMap<SystemStreamPartition, Offset>,
    window_ms: i64,
    commit_ms: i64,
    drop_deserialization_errors: bool,
    last_window: Instant,
    last_commit: Instant,
    metrics: MetricsRegistry,
    processed: Counter,
    dropped: Counter,
    windows: Counter,
    commits: Counter,
    commit_failures: Counter,
}

impl TaskInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_name: TaskName,
        partition: Partition,
        task: Box<dyn StreamTask>,
        input_ssps: HashSet<SystemStreamPartition>,
        storage: TaskStorageManager,
        producers: Arc<Mutex<SystemProducers>>,
        serdes: Arc<SerdeManager>,
        checkpoints: Option<Arc<Mutex<Box<dyn CheckpointManager>>>>,
        listeners: Vec<Box<dyn TaskLifecycleListener>>,
        task_config: &TaskConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        let now = Instant::now();
        Self {
            processed: metrics.counter("task.processed"),
            dropped: metrics.counter("task.dropped-deserialization-errors"),
            windows: metrics.counter("task.windows"),
            commits: metrics.counter("task.commits"),
            commit_failures: metrics.counter("task.commit-failures"),
            task_name,
            partition,
            task,
            input_ssps,
            storage,
            producers,
            serdes,
            checkpoints,
            listeners,
            collector: Collector::new(),
            offsets: BTreeMap::new(),
            window_ms: task_config.window_ms(),
            commit_ms: task_config.commit_ms(),
            drop_deserialization_errors: task_config.drop_deserialization_errors(),
            last_window: now,
            last_commit: now,
            metrics,
        }
    }

    pub fn name(&self) -> &TaskName {
        &self.task_name
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn input_ssps(&self) -> &HashSet<SystemStreamPartition> {
        &self.input_ssps
    }

    /// Register every input SSP with the consumer multiplexer at its
    /// starting offset: the checkpointed position (unless the stream sets
    /// `reset.offset`) or the stream's default offset policy.
    pub fn register_consumers(
        &mut self,
        consumers: &mut SystemConsumers,
        checkpoint: Option<&Checkpoint>,
        admins: &HashMap<String, Arc<dyn SystemAdmin>>,
        streams: &StreamConfig,
    ) -> Result<()> {
        let mut ssps: Vec<SystemStreamPartition> = self.input_ssps.iter().cloned().collect();
        ssps.sort();
        for ssp in ssps {
            let admin = admins
                .get(ssp.system())
                .ok_or_else(|| anyhow!("no admin for system '{}'", ssp.system()))?;
            let reset = streams.reset_offset(&ssp.system_stream);
            let checkpointed = if reset {
                None
            } else {
                checkpoint.and_then(|checkpoint| checkpoint.get(&ssp)).cloned()
            };
            let starting = match &checkpointed {
                Some(last_processed) => admin.next_offset(last_processed)?,
                None => match streams.offset_default(&ssp.system_stream)? {
                    OffsetDefault::Earliest => match admin.oldest_offset(&ssp)? {
                        Some(oldest) => oldest,
                        None => admin.upcoming_offset(&ssp)?,
                    },
                    OffsetDefault::Latest => admin.upcoming_offset(&ssp)?,
                },
            };
            if let Some(last_processed) = checkpointed {
                self.offsets.insert(ssp.clone(), last_processed);
            }
            info!(task = %self.task_name, "Input {ssp} starts at offset {starting}");
            consumers.register(&ssp, &starting)?;
        }
        Ok(())
    }

    pub async fn register_producers(&mut self) {
        self.producers.lock().await.register(self.task_name.as_str());
    }

    pub async fn register_checkpoints(&mut self) {
        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.lock().await.register(&self.task_name);
        }
    }

    pub async fn read_last_checkpoint(&mut self) -> Result<Option<Checkpoint>> {
        match &self.checkpoints {
            Some(checkpoints) => {
                checkpoints.lock().await.read_last_checkpoint(&self.task_name).await
            }
            None => Ok(None),
        }
    }

    /// Restore all change-logged stores; must complete before `init`
    pub async fn start_stores(&mut self) -> Result<()> {
        self.storage.restore_all().await
    }

    pub async fn init(&mut self) -> Result<()> {
        for listener in self.listeners.iter_mut() {
            listener.before_init(&self.task_name).await;
        }
        let mut ctx = TaskContext {
            task_name: &self.task_name,
            partition: self.partition,
            stores: &mut self.storage,
            metrics: &self.metrics,
        };
        self.task
            .init(&mut ctx)
            .await
            .with_context(|| format!("initializing task {}", self.task_name))?;
        for listener in self.listeners.iter_mut() {
            listener.after_init(&self.task_name).await;
        }
        Ok(())
    }

    /// Decode and process one envelope. The observed offset advances only
    /// after the user call returns successfully; dropped undecodable
    /// envelopes advance it too, so checkpoints move past poison input.
    pub async fn process(
        &mut self,
        envelope: IncomingEnvelope,
        coordinator: &mut Coordinator,
    ) -> Result<()> {
        if !self.input_ssps.contains(&envelope.ssp) {
            debug!(task = %self.task_name, "Ignoring envelope for foreign SSP {}", envelope.ssp);
            return Ok(());
        }
        let decoded = match self.serdes.decode(&envelope) {
            Ok(decoded) => decoded,
            Err(error) if self.drop_deserialization_errors => {
                warn!(
                    task = %self.task_name,
                    "Dropping undecodable envelope at {} offset {}: {error}",
                    envelope.ssp, envelope.offset
                );
                self.dropped.inc();
                self.offsets.insert(envelope.ssp.clone(), envelope.offset.clone());
                return Ok(());
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("decoding envelope at {} offset {}", envelope.ssp, envelope.offset)
                });
            }
        };
        for listener in self.listeners.iter_mut() {
            listener.before_process(&self.task_name, &decoded).await;
        }
        let mut ctx = TaskContext {
            task_name: &self.task_name,
            partition: self.partition,
            stores: &mut self.storage,
            metrics: &self.metrics,
        };
        match self.task.process(&decoded, &mut ctx, &mut self.collector, coordinator).await {
            Ok(()) => {
                for listener in self.listeners.iter_mut() {
                    listener.after_process(&self.task_name, &decoded).await;
                }
                self.offsets.insert(decoded.ssp.clone(), decoded.offset.clone());
                self.processed.inc();
                Ok(())
            }
            Err(error) => {
                for listener in self.listeners.iter_mut() {
                    listener.on_process_failure(&self.task_name, &decoded, &error).await;
                }
                Err(error).with_context(|| {
                    format!(
                        "task {} failed processing {} at offset {}",
                        self.task_name, decoded.ssp, decoded.offset
                    )
                })
            }
        }
    }

    /// Invoke the user window when enabled and due
    pub async fn window(&mut self, coordinator: &mut Coordinator) -> Result<()> {
        if self.window_ms < 0 {
            return Ok(());
        }
        if self.window_ms > 0
            && self.last_window.elapsed() < Duration::from_millis(self.window_ms as u64)
        {
            return Ok(());
        }
        self.last_window = Instant::now();
        self.windows.inc();
        let mut ctx = TaskContext {
            task_name: &self.task_name,
            partition: self.partition,
            stores: &mut self.storage,
            metrics: &self.metrics,
        };
        self.task
            .window(&mut ctx, &mut self.collector, coordinator)
            .await
            .with_context(|| format!("task {} window failed", self.task_name))
    }

    /// Drain the collector into the producer multiplexer
    pub async fn send(&mut self) -> Result<()> {
        if self.collector.is_empty() {
            return Ok(());
        }
        let mut producers = self.producers.lock().await;
        for envelope in self.collector.drain() {
            producers.send(self.task_name.as_str(), envelope).await?;
        }
        Ok(())
    }

    /// Run the commit protocol when due: flush stores, flush the task's
    /// producer source, then write the checkpoint. A failed commit aborts
    /// the checkpoint write and leaves retry to the next interval.
    pub async fn commit(&mut self, coordinator: &Coordinator) -> Result<()> {
        let due = coordinator.commit_requested()
            || self.commit_ms == 0
            || (self.commit_ms > 0
                && self.last_commit.elapsed() >= Duration::from_millis(self.commit_ms as u64));
        if !due {
            return Ok(());
        }
        self.last_commit = Instant::now();
        if let Err(failure) = self.commit_inner().await {
            self.commit_failures.inc();
            error!(
                task = %self.task_name,
                "Commit failed, retrying at the next interval: {failure:#}"
            );
        }
        Ok(())
    }

    async fn commit_inner(&mut self) -> Result<()> {
        self.storage.flush_all().await?;
        self.producers.lock().await.flush(self.task_name.as_str()).await?;
        if let Some(checkpoints) = &self.checkpoints {
            let checkpoint = Checkpoint::new(self.offsets.clone());
            checkpoints.lock().await.write_checkpoint(&self.task_name, &checkpoint).await?;
            debug!(task = %self.task_name, "Wrote checkpoint with {} offsets", checkpoint.len());
        }
        self.commits.inc();
        Ok(())
    }

    pub async fn close(&mut self) {
        for listener in self.listeners.iter_mut() {
            listener.before_close(&self.task_name).await;
        }
        if let Err(error) = self.task.close().await {
            error!(task = %self.task_name, "Task close failed: {error:#}");
        }
    }

    pub fn close_stores(&mut self) {
        self.storage.close_all();
    }
}
