//! Container assembly and lifecycle
//!
//! `build` wires every subsystem from config through the component
//! registry; `run` drives the start order, the run loop and the strict
//! reverse-order shutdown. Every subsystem that was started receives
//! exactly one stop, even when the loop or a later start step fails.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::Config;
use tokio::sync::Mutex;
use tracing::{error, info};

use weir_common::checkpoint::{Checkpoint, CheckpointManager};
use weir_common::config::{
    JobConfig, MetricsConfig, StorageConfig, StreamConfig, SystemConfig, TaskConfig,
};
use weir_common::metrics::{MetricsRegistry, MetricsReporter};
use weir_common::system::SystemAdmin;
use weir_common::{Partition, SystemStream};

use crate::consumers::SystemConsumers;
use crate::producers::SystemProducers;
use crate::registry::ComponentRegistry;
use crate::reporters::ReporterSet;
use crate::runloop::RunLoop;
use crate::serdes::{SerdeManager, SerdeRegistry};
use crate::storage::{ChangelogRestore, LoggedStore, TaskStorageManager};
use crate::task::TaskInstance;

const DEFAULT_STORE_SERDE: &str = "bytes";

pub struct Container {
    name: String,
    metrics: MetricsRegistry,
    task_registries: Vec<MetricsRegistry>,
    reporters: Vec<Box<dyn MetricsReporter>>,
    reporter_task: Option<ReporterSet>,
    reporter_interval: Duration,
    checkpoints: Option<Arc<Mutex<Box<dyn CheckpointManager>>>>,
    producers: Arc<Mutex<SystemProducers>>,
    admins: HashMap<String, Arc<dyn SystemAdmin>>,
    stream_config: StreamConfig,
    run_loop: RunLoop,
    shutdown: Arc<AtomicBool>,
    reporters_started: bool,
    checkpoints_started: bool,
    stores_started: bool,
    tasks_inited: bool,
    producers_started: bool,
    consumers_started: bool,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Container {
    /// Wire every subsystem from config. Any missing factory, codec or
    /// required key refuses the whole container.
    pub fn build(
        name: &str,
        partitions: &[Partition],
        config: Arc<Config>,
        components: &ComponentRegistry,
    ) -> Result<Self> {
        let partitions: BTreeSet<Partition> = partitions.iter().copied().collect();
        if partitions.is_empty() {
            bail!("no partitions assigned to container '{name}'");
        }

        let job_config = JobConfig::new(config.clone());
        let task_config = TaskConfig::new(config.clone());
        let system_config = SystemConfig::new(config.clone());
        let stream_config = StreamConfig::new(config.clone());
        let storage_config = StorageConfig::new(config.clone());
        let metrics_config = MetricsConfig::new(config.clone());

        let metrics = MetricsRegistry::new(name);
        let inputs = task_config.inputs()?;
        let poll_interval = Duration::from_millis(task_config.poll_interval_ms());

        // Every store with a changelog, by store name
        let mut changelogs: BTreeMap<String, SystemStream> = BTreeMap::new();
        for store in storage_config.store_names() {
            if let Some(changelog) = storage_config.changelog(&store)? {
                changelogs.insert(store, changelog);
            }
        }

        // Systems referenced anywhere: config table, inputs, changelogs
        let mut system_names: BTreeSet<String> =
            system_config.system_names().into_iter().collect();
        system_names.extend(inputs.iter().map(|input| input.system.clone()));
        system_names.extend(changelogs.values().map(|changelog| changelog.system.clone()));

        let mut consumers_by_system = HashMap::new();
        let mut producers_by_system = HashMap::new();
        let mut admins: HashMap<String, Arc<dyn SystemAdmin>> = HashMap::new();
        for system in &system_names {
            let factory = components.system_factory(&system_config.factory(system)?)?;
            consumers_by_system
                .insert(system.clone(), factory.consumer(system, &config, &metrics)?);
            producers_by_system
                .insert(system.clone(), factory.producer(system, &config, &metrics)?);
            admins.insert(system.clone(), Arc::from(factory.admin(system, &config)?));
        }

        let serde_registry = SerdeRegistry::from_config(&config, components)?;
        let serdes = Arc::new(SerdeManager::from_config(&config, &serde_registry)?);

        let chooser = components.chooser_factory(&task_config.chooser())?.build(&config)?;
        let consumers = SystemConsumers::new(
            consumers_by_system,
            chooser,
            task_config.queue_high_watermark(),
            task_config.queue_low_watermark(),
            poll_interval,
            &metrics,
        );
        let producers = Arc::new(Mutex::new(SystemProducers::new(
            producers_by_system,
            serdes.clone(),
            &metrics,
        )));

        let checkpoints = match task_config.checkpoint_factory() {
            Some(factory_name) => {
                let manager = components.checkpoint_factory(&factory_name)?.build(&config)?;
                Some(Arc::new(Mutex::new(manager)))
            }
            None => None,
        };

        let task_factory = components.task_factory(&task_config.task_class()?)?;

        let mut reporters = Vec::new();
        for reporter_name in metrics_config.reporters() {
            let factory =
                components.reporter_factory(&metrics_config.reporter_class(&reporter_name)?)?;
            reporters.push(factory.build(&reporter_name, &config)?);
        }

        let state_dir = job_config.state_dir();
        let mut tasks = BTreeMap::new();
        let mut task_registries = Vec::new();
        for partition in partitions {
            let task_name = job_config.task_name(partition);
            let task_metrics = MetricsRegistry::new(task_name.as_str());

            let mut storage =
                TaskStorageManager::new(task_name.clone(), partition, poll_interval, &task_metrics);
            for store in storage_config.store_names() {
                let engine_factory = components.store_factory(&storage_config.factory(&store)?)?;
                let path = state_dir.join(&store).join(partition.to_string());
                let engine = engine_factory.build(&store, partition, &path, &config)?;
                let key_serde = serde_registry.codec(
                    &storage_config.key_serde(&store).unwrap_or(DEFAULT_STORE_SERDE.to_string()),
                )?;
                let value_serde = serde_registry.codec(
                    &storage_config.msg_serde(&store).unwrap_or(DEFAULT_STORE_SERDE.to_string()),
                )?;
                let changelog_ssp =
                    changelogs.get(&store).map(|changelog| changelog.partition(partition));
                let logged = LoggedStore::new(
                    store.clone(),
                    engine,
                    key_serde,
                    value_serde,
                    changelog_ssp.clone(),
                    task_name.as_str(),
                    producers.clone(),
                    &task_metrics,
                );
                let restore = match changelog_ssp {
                    Some(ssp) => {
                        let factory =
                            components.system_factory(&system_config.factory(ssp.system())?)?;
                        let consumer = factory.consumer(ssp.system(), &config, &task_metrics)?;
                        let admin = admins
                            .get(ssp.system())
                            .cloned()
                            .with_context(|| format!("no admin for system '{}'", ssp.system()))?;
                        Some(ChangelogRestore { ssp, consumer, admin })
                    }
                    None => None,
                };
                storage.add_store(&store, logged, restore);
            }

            let mut listeners = Vec::new();
            for listener_name in task_config.lifecycle_listeners() {
                let factory = components
                    .listener_factory(&task_config.lifecycle_listener_class(&listener_name)?)?;
                listeners.push(factory.build(&listener_name, &config)?);
            }

            let input_ssps: HashSet<_> =
                inputs.iter().map(|input| input.partition(partition)).collect();
            let task = TaskInstance::new(
                task_name,
                partition,
                task_factory.build(&config)?,
                input_ssps,
                storage,
                producers.clone(),
                serdes.clone(),
                checkpoints.clone(),
                listeners,
                &task_config,
                task_metrics.clone(),
            );
            task_registries.push(task_metrics);
            tasks.insert(partition, task);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let run_loop = RunLoop::new(tasks, consumers, shutdown.clone(), &metrics);

        info!(container = name, "Built container with {} tasks", run_loop.task_count());
        Ok(Self {
            name: name.to_string(),
            metrics,
            task_registries,
            reporters,
            reporter_task: None,
            reporter_interval: Duration::from_millis(metrics_config.interval_ms()),
            checkpoints,
            producers,
            admins,
            stream_config,
            run_loop,
            shutdown,
            reporters_started: false,
            checkpoints_started: false,
            stores_started: false,
            tasks_inited: false,
            producers_started: false,
            consumers_started: false,
        })
    }

    /// Flag consulted at the end of every iteration; set it from a signal
    /// handler or a test to stop the container cooperatively
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Container registry first, then one per task
    pub fn metrics_registries(&self) -> Vec<MetricsRegistry> {
        let mut registries = vec![self.metrics.clone()];
        registries.extend(self.task_registries.iter().cloned());
        registries
    }

    /// Full lifecycle: start everything in order, run the loop, then stop
    /// everything in reverse order regardless of how the loop ended
    pub async fn run(mut self) -> Result<()> {
        let result = match self.start().await {
            Ok(()) => self.run_loop.run().await,
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            error!(container = %self.name, "Container failed: {error:#}");
        }
        self.stop().await;
        result
    }

    async fn start(&mut self) -> Result<()> {
        info!(container = %self.name, "Starting container");

        self.reporters_started = true;
        let reporters = std::mem::take(&mut self.reporters);
        self.reporter_task =
            Some(ReporterSet::spawn(reporters, self.metrics_registries(), self.reporter_interval));

        self.checkpoints_started = true;
        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.lock().await.start().await.context("starting checkpoint manager")?;
        }
        let mut read_checkpoints: HashMap<Partition, Checkpoint> = HashMap::new();
        for (partition, task) in self.run_loop.tasks_mut().iter_mut() {
            task.register_checkpoints().await;
            if let Some(checkpoint) = task.read_last_checkpoint().await? {
                read_checkpoints.insert(*partition, checkpoint);
            }
        }

        {
            let (tasks, consumers) = self.run_loop.parts_mut();
            for (partition, task) in tasks.iter_mut() {
                task.register_producers().await;
                task.register_consumers(
                    consumers,
                    read_checkpoints.get(partition),
                    &self.admins,
                    &self.stream_config,
                )?;
            }
        }

        self.stores_started = true;
        for task in self.run_loop.tasks_mut().values_mut() {
            task.start_stores().await?;
        }

        self.tasks_inited = true;
        for task in self.run_loop.tasks_mut().values_mut() {
            task.init().await?;
        }

        self.producers_started = true;
        self.producers.lock().await.start().await?;

        self.consumers_started = true;
        self.run_loop.consumers_mut().start().await?;

        info!(container = %self.name, "Container started");
        Ok(())
    }

    /// Reverse-order shutdown; errors are logged, never propagated, so
    /// every started subsystem gets its stop
    async fn stop(&mut self) {
        info!(container = %self.name, "Stopping container");
        if self.consumers_started {
            self.run_loop.consumers_mut().stop().await;
        }
        if self.producers_started {
            self.producers.lock().await.stop().await;
        }
        if self.tasks_inited {
            for task in self.run_loop.tasks_mut().values_mut() {
                task.close().await;
            }
        }
        if self.stores_started {
            for task in self.run_loop.tasks_mut().values_mut() {
                task.close_stores();
            }
        }
        if self.checkpoints_started {
            if let Some(checkpoints) = &self.checkpoints {
                if let Err(error) = checkpoints.lock().await.stop().await {
                    error!("Failed to stop checkpoint manager: {error:#}");
                }
            }
        }
        if self.reporters_started {
            if let Some(reporter_task) = self.reporter_task.take() {
                reporter_task.stop().await;
            }
        }
        info!(container = %self.name, "Container stopped");
    }
}
