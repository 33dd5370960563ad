//! Checkpoints: persisted consumption positions
//!
//! Convention at this boundary: a checkpointed offset is the *last
//! processed* offset for its SSP (inclusive). Resumption starts from the
//! owning system's `next_offset` of the checkpointed value.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use config::Config;

use crate::types::{Offset, SystemStreamPartition, TaskName};

/// Mapping SSP -> last processed offset, one per task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    offsets: BTreeMap<SystemStreamPartition, Offset>,
}

impl Checkpoint {
    pub fn new(offsets: BTreeMap<SystemStreamPartition, Offset>) -> Self {
        Self { offsets }
    }

    pub fn get(&self, ssp: &SystemStreamPartition) -> Option<&Offset> {
        self.offsets.get(ssp)
    }

    pub fn set(&mut self, ssp: SystemStreamPartition, offset: Offset) {
        self.offsets.insert(ssp, offset);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SystemStreamPartition, &Offset)> {
        self.offsets.iter()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Pluggable checkpoint backend. Writes are atomic per task; only the most
/// recent checkpoint per task is authoritative.
#[async_trait]
pub trait CheckpointManager: Send {
    fn register(&mut self, task: &TaskName);

    async fn start(&mut self) -> Result<()>;

    async fn write_checkpoint(&mut self, task: &TaskName, checkpoint: &Checkpoint) -> Result<()>;

    async fn read_last_checkpoint(&mut self, task: &TaskName) -> Result<Option<Checkpoint>>;

    async fn stop(&mut self) -> Result<()>;
}

/// Builds a checkpoint backend from config. The capability is optional:
/// no configured factory means no checkpointing at all.
pub trait CheckpointManagerFactory: Send + Sync {
    fn build(&self, config: &Config) -> Result<Box<dyn CheckpointManager>>;
}
