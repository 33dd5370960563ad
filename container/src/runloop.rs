//! The container run loop
//!
//! Single-threaded and cooperative: each iteration processes at most one
//! envelope, then gives every task its window, send and commit turns. A
//! null choose still runs the timer-driven phases, which keeps windows
//! and commits live on idle input. Shutdown requests are honored only
//! after send and commit complete, so no enqueued output is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use weir_common::metrics::{Counter, MetricsRegistry};
use weir_common::task::Coordinator;
use weir_common::{Partition, SystemStreamPartition};

use crate::consumers::SystemConsumers;
use crate::task::TaskInstance;

pub struct RunLoop {
    tasks: BTreeMap<Partition, TaskInstance>,
    by_ssp: HashMap<SystemStreamPartition, Partition>,
    consumers: SystemConsumers,
    shutdown: Arc<AtomicBool>,
    iterations: Counter,
    envelopes: Counter,
    null_iterations: Counter,
}

impl RunLoop {
    pub fn new(
        tasks: BTreeMap<Partition, TaskInstance>,
        consumers: SystemConsumers,
        shutdown: Arc<AtomicBool>,
        metrics: &MetricsRegistry,
    ) -> Self {
        let mut by_ssp = HashMap::new();
        for (partition, task) in &tasks {
            for ssp in task.input_ssps() {
                by_ssp.insert(ssp.clone(), *partition);
            }
        }
        Self {
            tasks,
            by_ssp,
            consumers,
            shutdown,
            iterations: metrics.counter("container.iterations"),
            envelopes: metrics.counter("container.envelopes"),
            null_iterations: metrics.counter("container.null-iterations"),
        }
    }

    /// Split borrow for container start-up wiring
    pub fn parts_mut(
        &mut self,
    ) -> (&mut BTreeMap<Partition, TaskInstance>, &mut SystemConsumers) {
        (&mut self.tasks, &mut self.consumers)
    }

    pub fn tasks_mut(&mut self) -> &mut BTreeMap<Partition, TaskInstance> {
        &mut self.tasks
    }

    pub fn consumers_mut(&mut self) -> &mut SystemConsumers {
        &mut self.consumers
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Entering run loop with {} tasks", self.tasks.len());
        loop {
            self.iterations.inc();
            let mut coordinator = Coordinator::new();
            self.process(&mut coordinator).await?;
            self.window(&mut coordinator).await?;
            self.send().await?;
            self.commit(&coordinator).await?;
            if coordinator.shutdown_requested() || self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, leaving run loop");
                break;
            }
        }
        Ok(())
    }

    /// At most one envelope per iteration, routed by SSP
    async fn process(&mut self, coordinator: &mut Coordinator) -> Result<()> {
        let Some(envelope) = self.consumers.choose().await? else {
            self.null_iterations.inc();
            return Ok(());
        };
        self.envelopes.inc();
        let Some(partition) = self.by_ssp.get(&envelope.ssp) else {
            warn!("Envelope for unassigned SSP {}", envelope.ssp);
            return Ok(());
        };
        let task = self.tasks.get_mut(partition).expect("task exists for routed partition");
        task.process(envelope, coordinator).await
    }

    async fn window(&mut self, coordinator: &mut Coordinator) -> Result<()> {
        for task in self.tasks.values_mut() {
            task.window(coordinator).await?;
        }
        Ok(())
    }

    async fn send(&mut self) -> Result<()> {
        for task in self.tasks.values_mut() {
            task.send().await?;
        }
        Ok(())
    }

    async fn commit(&mut self, coordinator: &Coordinator) -> Result<()> {
        for task in self.tasks.values_mut() {
            task.commit(coordinator).await?;
        }
        Ok(())
    }
}
