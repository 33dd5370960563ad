//! Typed read-only views over the opaque key/value configuration
//!
//! The container receives its whole configuration as an `Arc<Config>`;
//! these views give each subsystem a narrow, typed window onto it.
//! Required-key misses are setup-fatal and name the exact key.

use std::path::PathBuf;
use std::sync::Arc;

use config::Config;

use crate::errors::ConfigError;
use crate::types::{Partition, SystemStream, TaskName};

const DEFAULT_JOB_NAME: (&str, &str) = ("job.name", "job");
const DEFAULT_STATE_DIR: (&str, &str) = ("job.state.dir", "state");

const DEFAULT_WINDOW_MS: (&str, i64) = ("task.window.ms", -1);
const DEFAULT_COMMIT_MS: (&str, i64) = ("task.commit.ms", 60_000);
const DEFAULT_CHOOSER: (&str, &str) = ("task.message.chooser.class", "round-robin");
const DEFAULT_POLL_INTERVAL_MS: (&str, i64) = ("task.poll.interval.ms", 50);
const DEFAULT_HIGH_WATERMARK: (&str, i64) = ("task.consumer.queue.high.watermark", 1000);
const DEFAULT_LOW_WATERMARK: (&str, i64) = ("task.consumer.queue.low.watermark", 100);

const DEFAULT_METRICS_PORT: (&str, i64) = ("metrics.port", 5959);
const DEFAULT_METRICS_INTERVAL_MS: (&str, i64) = ("metrics.interval.ms", 60_000);

fn required(config: &Config, key: &str) -> Result<String, ConfigError> {
    config.get_string(key).map_err(|_| ConfigError::MissingKey(key.to_string()))
}

fn comma_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// Job-level settings: naming and filesystem layout
#[derive(Clone)]
pub struct JobConfig {
    config: Arc<Config>,
}

impl JobConfig {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn name(&self) -> String {
        self.config.get_string(DEFAULT_JOB_NAME.0).unwrap_or(DEFAULT_JOB_NAME.1.to_string())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(
            self.config.get_string(DEFAULT_STATE_DIR.0).unwrap_or(DEFAULT_STATE_DIR.1.to_string()),
        )
    }

    pub fn task_name(&self, partition: Partition) -> TaskName {
        TaskName::new(&self.name(), partition)
    }
}

/// Task wiring: user class, inputs, timers, chooser, error policy
#[derive(Clone)]
pub struct TaskConfig {
    config: Arc<Config>,
}

impl TaskConfig {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn task_class(&self) -> Result<String, ConfigError> {
        required(&self.config, "task.class")
    }

    pub fn inputs(&self) -> Result<Vec<SystemStream>, ConfigError> {
        let raw = required(&self.config, "task.inputs")?;
        let specs = comma_list(&raw);
        if specs.is_empty() {
            return Err(ConfigError::invalid("task.inputs", "no input streams listed"));
        }
        specs.iter().map(|spec| SystemStream::parse(spec)).collect()
    }

    /// Window interval in ms; negative disables windowing
    pub fn window_ms(&self) -> i64 {
        self.config.get_int(DEFAULT_WINDOW_MS.0).unwrap_or(DEFAULT_WINDOW_MS.1)
    }

    /// Commit interval in ms; zero commits every iteration, negative
    /// commits only on coordinator request
    pub fn commit_ms(&self) -> i64 {
        self.config.get_int(DEFAULT_COMMIT_MS.0).unwrap_or(DEFAULT_COMMIT_MS.1)
    }

    /// Checkpoint backend factory; absent disables checkpointing
    pub fn checkpoint_factory(&self) -> Option<String> {
        self.config.get_string("task.checkpoint.factory").ok()
    }

    pub fn chooser(&self) -> String {
        self.config.get_string(DEFAULT_CHOOSER.0).unwrap_or(DEFAULT_CHOOSER.1.to_string())
    }

    pub fn drop_deserialization_errors(&self) -> bool {
        self.config.get_bool("task.drop.deserialization.errors").unwrap_or(false)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.config.get_int(DEFAULT_POLL_INTERVAL_MS.0).unwrap_or(DEFAULT_POLL_INTERVAL_MS.1).max(0)
            as u64
    }

    pub fn queue_high_watermark(&self) -> usize {
        self.config.get_int(DEFAULT_HIGH_WATERMARK.0).unwrap_or(DEFAULT_HIGH_WATERMARK.1).max(1)
            as usize
    }

    pub fn queue_low_watermark(&self) -> usize {
        self.config.get_int(DEFAULT_LOW_WATERMARK.0).unwrap_or(DEFAULT_LOW_WATERMARK.1).max(0)
            as usize
    }

    pub fn lifecycle_listeners(&self) -> Vec<String> {
        self.config
            .get_string("task.lifecycle.listeners")
            .map(|raw| comma_list(&raw))
            .unwrap_or_default()
    }

    pub fn lifecycle_listener_class(&self, name: &str) -> Result<String, ConfigError> {
        required(&self.config, &format!("task.lifecycle.listener.{name}.class"))
    }
}

/// Per-system settings: factory and default codecs
#[derive(Clone)]
pub struct SystemConfig {
    config: Arc<Config>,
}

impl SystemConfig {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// All systems named under `systems.`, sorted for determinism
    pub fn system_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.config.get_table("systems").map(|table| table.into_keys().collect())
                .unwrap_or_default();
        names.sort();
        names
    }

    pub fn factory(&self, system: &str) -> Result<String, ConfigError> {
        required(&self.config, &format!("systems.{system}.factory"))
    }

    pub fn key_serde(&self, system: &str) -> Option<String> {
        self.config.get_string(&format!("systems.{system}.key.serde")).ok()
    }

    pub fn msg_serde(&self, system: &str) -> Option<String> {
        self.config.get_string(&format!("systems.{system}.msg.serde")).ok()
    }
}

/// Where consumption starts when no checkpoint applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetDefault {
    Earliest,
    #[default]
    Latest,
}

/// Per-stream settings: codec overrides and offset policy
#[derive(Clone)]
pub struct StreamConfig {
    config: Arc<Config>,
}

impl StreamConfig {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn stream_key(&self, ss: &SystemStream, suffix: &str) -> String {
        format!("streams.{}.{}.{suffix}", ss.system, ss.stream)
    }

    pub fn key_serde(&self, ss: &SystemStream) -> Option<String> {
        self.config.get_string(&self.stream_key(ss, "key.serde")).ok()
    }

    pub fn msg_serde(&self, ss: &SystemStream) -> Option<String> {
        self.config.get_string(&self.stream_key(ss, "msg.serde")).ok()
    }

    /// While set, checkpointed offsets for this stream are ignored on
    /// every container start
    pub fn reset_offset(&self, ss: &SystemStream) -> bool {
        self.config.get_bool(&self.stream_key(ss, "reset.offset")).unwrap_or(false)
    }

    pub fn offset_default(&self, ss: &SystemStream) -> Result<OffsetDefault, ConfigError> {
        let key = self.stream_key(ss, "offset.default");
        match self.config.get_string(&key) {
            Err(_) => Ok(OffsetDefault::default()),
            Ok(value) => match value.as_str() {
                "earliest" => Ok(OffsetDefault::Earliest),
                "latest" => Ok(OffsetDefault::Latest),
                other => Err(ConfigError::invalid(
                    &key,
                    format!("expected 'earliest' or 'latest', got '{other}'"),
                )),
            },
        }
    }
}

/// Per-store settings: engine factory, changelog, codecs
#[derive(Clone)]
pub struct StorageConfig {
    config: Arc<Config>,
}

impl StorageConfig {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// All stores named under `stores.`, sorted for determinism
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.config.get_table("stores").map(|table| table.into_keys().collect())
                .unwrap_or_default();
        names.sort();
        names
    }

    pub fn factory(&self, store: &str) -> Result<String, ConfigError> {
        required(&self.config, &format!("stores.{store}.factory"))
    }

    pub fn changelog(&self, store: &str) -> Result<Option<SystemStream>, ConfigError> {
        match self.config.get_string(&format!("stores.{store}.changelog")) {
            Err(_) => Ok(None),
            Ok(spec) => SystemStream::parse(&spec).map(Some),
        }
    }

    pub fn key_serde(&self, store: &str) -> Option<String> {
        self.config.get_string(&format!("stores.{store}.key.serde")).ok()
    }

    pub fn msg_serde(&self, store: &str) -> Option<String> {
        self.config.get_string(&format!("stores.{store}.msg.serde")).ok()
    }
}

/// Codec registry entries
#[derive(Clone)]
pub struct SerializerConfig {
    config: Arc<Config>,
}

impl SerializerConfig {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Codec names declared under `serializers.registry.`, sorted
    pub fn serde_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .config
            .get_table("serializers.registry")
            .map(|table| table.into_keys().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn serde_factory(&self, name: &str) -> Result<String, ConfigError> {
        required(&self.config, &format!("serializers.registry.{name}.class"))
    }
}

/// Metrics reporter wiring and the diagnostics endpoint
#[derive(Clone)]
pub struct MetricsConfig {
    config: Arc<Config>,
}

impl MetricsConfig {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn reporters(&self) -> Vec<String> {
        self.config.get_string("metrics.reporters").map(|raw| comma_list(&raw)).unwrap_or_default()
    }

    pub fn reporter_class(&self, name: &str) -> Result<String, ConfigError> {
        required(&self.config, &format!("metrics.reporter.{name}.class"))
    }

    pub fn port(&self) -> u16 {
        self.config.get_int(DEFAULT_METRICS_PORT.0).unwrap_or(DEFAULT_METRICS_PORT.1) as u16
    }

    pub fn interval_ms(&self) -> u64 {
        self.config
            .get_int(DEFAULT_METRICS_INTERVAL_MS.0)
            .unwrap_or(DEFAULT_METRICS_INTERVAL_MS.1)
            .max(1) as u64
    }
}
