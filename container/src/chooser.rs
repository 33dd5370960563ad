//! Message chooser: picks the next envelope among ready partitions
//!
//! The multiplexer offers the chooser at most one envelope per SSP at a
//! time, so a chooser never reorders within a partition; its only freedom
//! is which partition goes next.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use config::Config;

use weir_common::{IncomingEnvelope, Offset, SystemStreamPartition};

pub trait MessageChooser: Send {
    /// Called once per SSP before the multiplexer starts
    fn register(&mut self, ssp: &SystemStreamPartition, offset: &Offset);

    /// Offer one envelope for a registered SSP
    fn update(&mut self, envelope: IncomingEnvelope);

    /// Take one queued envelope, or None when no partition has a candidate
    fn choose(&mut self) -> Option<IncomingEnvelope>;
}

pub trait ChooserFactory: Send + Sync {
    fn build(&self, config: &Config) -> Result<Box<dyn MessageChooser>>;
}

/// Default policy: a FIFO of ready SSPs. An SSP re-enters the tail when
/// its next envelope is offered, which yields round-robin interleaving
/// and starvation freedom whenever every SSP keeps supplying envelopes.
#[derive(Default)]
pub struct RoundRobinChooser {
    ready: VecDeque<SystemStreamPartition>,
    buffered: HashMap<SystemStreamPartition, IncomingEnvelope>,
}

impl RoundRobinChooser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageChooser for RoundRobinChooser {
    fn register(&mut self, _ssp: &SystemStreamPartition, _offset: &Offset) {}

    fn update(&mut self, envelope: IncomingEnvelope) {
        let ssp = envelope.ssp.clone();
        if self.buffered.insert(ssp.clone(), envelope).is_none() {
            self.ready.push_back(ssp);
        }
    }

    fn choose(&mut self) -> Option<IncomingEnvelope> {
        let ssp = self.ready.pop_front()?;
        self.buffered.remove(&ssp)
    }
}

pub struct RoundRobinChooserFactory;

impl ChooserFactory for RoundRobinChooserFactory {
    fn build(&self, _config: &Config) -> Result<Box<dyn MessageChooser>> {
        Ok(Box::new(RoundRobinChooser::new()))
    }
}
