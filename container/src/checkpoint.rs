//! Built-in checkpoint backends
//!
//! The file backend keeps one JSON document per task and writes it
//! atomically (temp file + rename), which is enough for single-node
//! restarts. The memory backend is for tests; it can share its write
//! history with the test through the factory.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use config::Config;
use serde::{Deserialize, Serialize};
use tracing::debug;

use weir_common::checkpoint::{Checkpoint, CheckpointManager, CheckpointManagerFactory};
use weir_common::config::JobConfig;
use weir_common::{Offset, Partition, SystemStreamPartition, TaskName};

#[derive(Serialize, Deserialize)]
struct CheckpointEntry {
    system: String,
    stream: String,
    partition: u32,
    offset: String,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    task: String,
    offsets: Vec<CheckpointEntry>,
}

fn to_file(task: &TaskName, checkpoint: &Checkpoint) -> CheckpointFile {
    CheckpointFile {
        task: task.as_str().to_string(),
        offsets: checkpoint
            .iter()
            .map(|(ssp, offset)| CheckpointEntry {
                system: ssp.system().to_string(),
                stream: ssp.stream().to_string(),
                partition: ssp.partition.0,
                offset: offset.as_str().to_string(),
            })
            .collect(),
    }
}

fn from_file(file: CheckpointFile) -> Checkpoint {
    let mut checkpoint = Checkpoint::default();
    for entry in file.offsets {
        checkpoint.set(
            SystemStreamPartition::new(&entry.system, &entry.stream, Partition(entry.partition)),
            Offset::new(entry.offset),
        );
    }
    checkpoint
}

/// One JSON document per task under `<state-dir>/checkpoints/`
pub struct FileCheckpointManager {
    dir: PathBuf,
}

impl FileCheckpointManager {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, task: &TaskName) -> PathBuf {
        self.dir.join(format!("{task}.json"))
    }
}

#[async_trait]
impl CheckpointManager for FileCheckpointManager {
    fn register(&mut self, task: &TaskName) {
        debug!("Tracking checkpoints for task {task} under {}", self.dir.display());
    }

    async fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating checkpoint dir {}", self.dir.display()))
    }

    async fn write_checkpoint(&mut self, task: &TaskName, checkpoint: &Checkpoint) -> Result<()> {
        let body = serde_json::to_vec_pretty(&to_file(task, checkpoint))?;
        let path = self.path_for(task);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, body)
            .with_context(|| format!("writing checkpoint staging file {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("publishing checkpoint file {}", path.display()))
    }

    async fn read_last_checkpoint(&mut self, task: &TaskName) -> Result<Option<Checkpoint>> {
        let path = self.path_for(task);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("reading checkpoint file {}", path.display()))
            }
        };
        let file: CheckpointFile = serde_json::from_slice(&body)
            .with_context(|| format!("parsing checkpoint file {}", path.display()))?;
        Ok(Some(from_file(file)))
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct FileCheckpointManagerFactory;

impl CheckpointManagerFactory for FileCheckpointManagerFactory {
    fn build(&self, config: &Config) -> Result<Box<dyn CheckpointManager>> {
        let job = JobConfig::new(Arc::new(config.clone()));
        Ok(Box::new(FileCheckpointManager::new(job.state_dir().join("checkpoints"))))
    }
}

/// Chronological record of writes, shared with tests through the factory
pub type CheckpointHistory = Arc<Mutex<Vec<(TaskName, Checkpoint)>>>;

/// Purely in-memory backend
#[derive(Default)]
pub struct MemoryCheckpointManager {
    checkpoints: HashMap<TaskName, Checkpoint>,
    history: Option<CheckpointHistory>,
}

impl MemoryCheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: CheckpointHistory) -> Self {
        Self {
            checkpoints: HashMap::new(),
            history: Some(history),
        }
    }
}

#[async_trait]
impl CheckpointManager for MemoryCheckpointManager {
    fn register(&mut self, _task: &TaskName) {}

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_checkpoint(&mut self, task: &TaskName, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.insert(task.clone(), checkpoint.clone());
        if let Some(history) = &self.history {
            history.lock().unwrap().push((task.clone(), checkpoint.clone()));
        }
        Ok(())
    }

    async fn read_last_checkpoint(&mut self, task: &TaskName) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(task).cloned())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryCheckpointManagerFactory {
    history: Option<CheckpointHistory>,
}

impl MemoryCheckpointManagerFactory {
    pub fn new() -> Self {
        Self { history: None }
    }

    pub fn with_history(history: CheckpointHistory) -> Self {
        Self { history: Some(history) }
    }
}

impl Default for MemoryCheckpointManagerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointManagerFactory for MemoryCheckpointManagerFactory {
    fn build(&self, _config: &Config) -> Result<Box<dyn CheckpointManager>> {
        Ok(Box::new(match &self.history {
            Some(history) => MemoryCheckpointManager::with_history(history.clone()),
            None => MemoryCheckpointManager::new(),
        }))
    }
}
