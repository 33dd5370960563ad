//! Messaging-system capability contracts
//!
//! A messaging system plugs in as a factory producing three collaborators:
//! a consumer (pull side), a producer (push side) and an admin (offset
//! intelligence). The container only ever talks to these contracts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use config::Config;

use crate::metrics::MetricsRegistry;
use crate::types::{IncomingEnvelope, Offset, OutgoingEnvelope, SystemStreamPartition};

/// Pull side of one messaging system.
///
/// All `register` calls precede `start`. For one SSP, `poll` returns
/// envelopes in the system's offset order, resuming where the previous
/// poll left off.
#[async_trait]
pub trait SystemConsumer: Send {
    fn register(&mut self, ssp: &SystemStreamPartition, offset: &Offset) -> Result<()>;

    async fn start(&mut self) -> Result<()>;

    /// Fetch whatever is available on the given SSPs, waiting at most
    /// `timeout` when nothing is ready. Returned envelopes carry raw
    /// (undecoded) key and value bytes.
    async fn poll(
        &mut self,
        ssps: &HashSet<SystemStreamPartition>,
        timeout: Duration,
    ) -> Result<HashMap<SystemStreamPartition, Vec<IncomingEnvelope>>>;

    async fn stop(&mut self) -> Result<()>;
}

/// Push side of one messaging system. `flush(source)` blocks until every
/// write accepted from that source is durable from the system's
/// perspective; together with replay on restart this gives at-least-once.
#[async_trait]
pub trait SystemProducer: Send {
    fn register(&mut self, source: &str);

    async fn start(&mut self) -> Result<()>;

    async fn send(&mut self, source: &str, envelope: OutgoingEnvelope) -> Result<()>;

    async fn flush(&mut self, source: &str) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

/// Offset intelligence for one messaging system
pub trait SystemAdmin: Send + Sync {
    /// Oldest offset still available, or None for an empty partition
    fn oldest_offset(&self, ssp: &SystemStreamPartition) -> Result<Option<Offset>>;

    /// Offset of the last published message, or None for an empty partition
    fn newest_offset(&self, ssp: &SystemStreamPartition) -> Result<Option<Offset>>;

    /// Offset the next published message will get
    fn upcoming_offset(&self, ssp: &SystemStreamPartition) -> Result<Offset>;

    /// Successor of an offset under this system's ordering. Used to resume
    /// after an inclusive (last-processed) checkpoint.
    fn next_offset(&self, offset: &Offset) -> Result<Offset>;
}

/// Builds the three collaborators for a named system
pub trait SystemFactory: Send + Sync {
    fn consumer(
        &self,
        system: &str,
        config: &Config,
        metrics: &MetricsRegistry,
    ) -> Result<Box<dyn SystemConsumer>>;

    fn producer(
        &self,
        system: &str,
        config: &Config,
        metrics: &MetricsRegistry,
    ) -> Result<Box<dyn SystemProducer>>;

    fn admin(&self, system: &str, config: &Config) -> Result<Box<dyn SystemAdmin>>;
}

impl fmt::Debug for dyn SystemFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemFactory").finish_non_exhaustive()
    }
}
