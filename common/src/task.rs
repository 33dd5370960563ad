//! User-task contracts: the task lifecycle, its collector and the
//! per-iteration coordinator

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use config::Config;

use crate::metrics::MetricsRegistry;
use crate::storage::KeyValueStore;
use crate::types::{IncomingEnvelope, OutgoingEnvelope, Partition, TaskName};

/// Per-iteration signal object. Created fresh each run-loop iteration and
/// discarded at its end; requests are honored after send+commit complete.
#[derive(Debug, Default)]
pub struct Coordinator {
    commit_requested: bool,
    shutdown_requested: bool,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_commit(&mut self) {
        self.commit_requested = true;
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn commit_requested(&self) -> bool {
        self.commit_requested
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }
}

/// Outbound scratch buffer. Lives for one process->send span; the backing
/// allocation is reused across iterations.
#[derive(Debug, Default)]
pub struct Collector {
    buffered: Vec<OutgoingEnvelope>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, envelope: OutgoingEnvelope) {
        self.buffered.push(envelope);
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, OutgoingEnvelope> {
        self.buffered.drain(..)
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}

/// Access to the stores owned by one task partition
pub trait StoreAccess: Send {
    fn store(&mut self, name: &str) -> Option<&mut dyn KeyValueStore>;
}

/// What a task sees of its own instance during lifecycle calls
pub struct TaskContext<'a> {
    pub task_name: &'a TaskName,
    pub partition: Partition,
    pub stores: &'a mut dyn StoreAccess,
    pub metrics: &'a MetricsRegistry,
}

impl TaskContext<'_> {
    /// Named store lookup; unknown names are an error rather than a None
    /// because tasks declare their stores in config up front.
    pub fn store(&mut self, name: &str) -> Result<&mut dyn KeyValueStore> {
        self.stores.store(name).ok_or_else(|| anyhow!("no store '{name}' configured for this task"))
    }
}

/// The user-supplied task logic, instantiated once per assigned partition
#[async_trait]
pub trait StreamTask: Send {
    async fn init(&mut self, _ctx: &mut TaskContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Handle one decoded envelope. Outbound messages go through the
    /// collector; commit/shutdown requests through the coordinator.
    async fn process(
        &mut self,
        envelope: &IncomingEnvelope,
        ctx: &mut TaskContext<'_>,
        collector: &mut Collector,
        coordinator: &mut Coordinator,
    ) -> Result<()>;

    /// Called on the configured window interval; never called when
    /// windowing is disabled
    async fn window(
        &mut self,
        _ctx: &mut TaskContext<'_>,
        _collector: &mut Collector,
        _coordinator: &mut Coordinator,
    ) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds the user task named by `task.class`
pub trait TaskFactory: Send + Sync {
    fn build(&self, config: &Config) -> Result<Box<dyn StreamTask>>;
}

/// Observes task lifecycle transitions. Listener failures are logged, not
/// propagated; listeners must not affect processing outcomes.
#[async_trait]
pub trait TaskLifecycleListener: Send {
    async fn before_init(&mut self, _task: &TaskName) {}

    async fn after_init(&mut self, _task: &TaskName) {}

    async fn before_process(&mut self, _task: &TaskName, _envelope: &IncomingEnvelope) {}

    async fn after_process(&mut self, _task: &TaskName, _envelope: &IncomingEnvelope) {}

    async fn on_process_failure(
        &mut self,
        _task: &TaskName,
        _envelope: &IncomingEnvelope,
        _error: &anyhow::Error,
    ) {
    }

    async fn before_close(&mut self, _task: &TaskName) {}
}

/// Builds one listener per task from `task.lifecycle.listener.<name>.class`
pub trait LifecycleListenerFactory: Send + Sync {
    fn build(&self, name: &str, config: &Config) -> Result<Box<dyn TaskLifecycleListener>>;
}
