//! Consumer multiplexer: bounded, backpressure-aware fan-in over one
//! poller per messaging system
//!
//! Envelopes land in per-SSP buffers. Each SSP has at most one envelope
//! in flight inside the chooser, which preserves per-SSP order end to
//! end. Buffers past the high watermark pause fetching for their SSP
//! until they drain to the low watermark.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, error};

use weir_common::metrics::{Counter, MetricsRegistry};
use weir_common::system::SystemConsumer;
use weir_common::{IncomingEnvelope, Offset, SystemStreamPartition};

use crate::chooser::MessageChooser;

pub struct SystemConsumers {
    consumers: HashMap<String, Box<dyn SystemConsumer>>,
    chooser: Box<dyn MessageChooser>,
    buffers: HashMap<SystemStreamPartition, VecDeque<IncomingEnvelope>>,
    by_system: HashMap<String, HashSet<SystemStreamPartition>>,
    /// SSPs currently eligible for fetching (below the high watermark)
    fetchable: HashSet<SystemStreamPartition>,
    /// SSPs whose head envelope is currently held by the chooser
    offered: HashSet<SystemStreamPartition>,
    high_watermark: usize,
    low_watermark: usize,
    poll_interval: Duration,
    polls: Counter,
    choices: Counter,
    null_choices: Counter,
}

impl SystemConsumers {
    pub fn new(
        consumers: HashMap<String, Box<dyn SystemConsumer>>,
        chooser: Box<dyn MessageChooser>,
        high_watermark: usize,
        low_watermark: usize,
        poll_interval: Duration,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            consumers,
            chooser,
            buffers: HashMap::new(),
            by_system: HashMap::new(),
            fetchable: HashSet::new(),
            offered: HashSet::new(),
            high_watermark,
            low_watermark,
            poll_interval,
            polls: metrics.counter("consumers.polls"),
            choices: metrics.counter("consumers.choices"),
            null_choices: metrics.counter("consumers.null-choices"),
        }
    }

    /// Register one SSP at its starting offset; propagates to the owning
    /// system consumer and the chooser. Must precede `start`.
    pub fn register(&mut self, ssp: &SystemStreamPartition, offset: &Offset) -> Result<()> {
        let Some(consumer) = self.consumers.get_mut(ssp.system()) else {
            bail!("no consumer for system '{}' (wanted by {ssp})", ssp.system());
        };
        consumer.register(ssp, offset)?;
        self.buffers.entry(ssp.clone()).or_default();
        self.by_system.entry(ssp.system().to_string()).or_default().insert(ssp.clone());
        self.fetchable.insert(ssp.clone());
        self.chooser.register(ssp, offset);
        debug!("Registered {ssp} at offset {offset}");
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        for (system, consumer) in self.consumers.iter_mut() {
            consumer.start().await.map_err(|e| {
                anyhow::anyhow!("starting consumer for system '{system}': {e:#}")
            })?;
        }
        // Prime the chooser with the head of every non-empty buffer.
        let buffered: Vec<SystemStreamPartition> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(ssp, _)| ssp.clone())
            .collect();
        for ssp in buffered {
            self.offer_head(&ssp);
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        for (system, consumer) in self.consumers.iter_mut() {
            if let Err(error) = consumer.stop().await {
                error!("Failed to stop consumer for system '{system}': {error:#}");
            }
        }
    }

    /// Return at most one envelope. When the chooser is empty, poll the
    /// systems (bounded by the no-new-message interval) and ask once more.
    pub async fn choose(&mut self) -> Result<Option<IncomingEnvelope>> {
        if let Some(envelope) = self.chooser.choose() {
            self.after_choice(&envelope);
            return Ok(Some(envelope));
        }
        let timeout = self.poll_interval;
        self.poll(timeout).await?;
        match self.chooser.choose() {
            Some(envelope) => {
                self.after_choice(&envelope);
                Ok(Some(envelope))
            }
            None => {
                self.null_choices.inc();
                Ok(None)
            }
        }
    }

    fn after_choice(&mut self, envelope: &IncomingEnvelope) {
        self.choices.inc();
        let ssp = envelope.ssp.clone();
        self.offered.remove(&ssp);
        self.offer_head(&ssp);
        self.maybe_resume(&ssp);
    }

    /// Hand the chooser the next buffered envelope for an SSP, if it does
    /// not already hold one
    fn offer_head(&mut self, ssp: &SystemStreamPartition) {
        if self.offered.contains(ssp) {
            return;
        }
        let Some(envelope) = self.buffers.get_mut(ssp).and_then(VecDeque::pop_front) else {
            return;
        };
        self.chooser.update(envelope);
        self.offered.insert(ssp.clone());
    }

    fn queued(&self, ssp: &SystemStreamPartition) -> usize {
        let buffered = self.buffers.get(ssp).map(VecDeque::len).unwrap_or(0);
        buffered + usize::from(self.offered.contains(ssp))
    }

    fn maybe_pause(&mut self, ssp: &SystemStreamPartition) {
        if self.queued(ssp) >= self.high_watermark {
            self.fetchable.remove(ssp);
        }
    }

    fn maybe_resume(&mut self, ssp: &SystemStreamPartition) {
        if self.buffers.contains_key(ssp) && self.queued(ssp) <= self.low_watermark {
            self.fetchable.insert(ssp.clone());
        }
    }

    async fn poll(&mut self, timeout: Duration) -> Result<()> {
        let mut systems: Vec<String> = self.consumers.keys().cloned().collect();
        systems.sort();
        for system in systems {
            let ssps: HashSet<SystemStreamPartition> = match self.by_system.get(&system) {
                Some(registered) => registered.intersection(&self.fetchable).cloned().collect(),
                None => continue,
            };
            if ssps.is_empty() {
                continue;
            }
            let polled = {
                let consumer = self.consumers.get_mut(&system).expect("known system");
                consumer.poll(&ssps, timeout).await?
            };
            self.polls.inc();
            for (ssp, envelopes) in polled {
                if envelopes.is_empty() {
                    continue;
                }
                let Some(buffer) = self.buffers.get_mut(&ssp) else {
                    debug!("Dropping poll result for unregistered {ssp}");
                    continue;
                };
                buffer.extend(envelopes);
                self.offer_head(&ssp);
                self.maybe_pause(&ssp);
            }
        }
        Ok(())
    }
}
