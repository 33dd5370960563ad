//! Producer multiplexer: routes outbound envelopes to the producer for
//! their destination system, encoding on the way out

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::error;

use weir_common::metrics::{Counter, MetricsRegistry};
use weir_common::system::SystemProducer;
use weir_common::OutgoingEnvelope;

use crate::serdes::SerdeManager;

pub struct SystemProducers {
    producers: HashMap<String, Box<dyn SystemProducer>>,
    serdes: Arc<SerdeManager>,
    sends: Counter,
    flushes: Counter,
}

impl SystemProducers {
    pub fn new(
        producers: HashMap<String, Box<dyn SystemProducer>>,
        serdes: Arc<SerdeManager>,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            producers,
            serdes,
            sends: metrics.counter("producers.sends"),
            flushes: metrics.counter("producers.flushes"),
        }
    }

    /// Register a source (task) with every producer
    pub fn register(&mut self, source: &str) {
        for producer in self.producers.values_mut() {
            producer.register(source);
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        for (system, producer) in self.producers.iter_mut() {
            producer
                .start()
                .await
                .with_context(|| format!("starting producer for system '{system}'"))?;
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        for (system, producer) in self.producers.iter_mut() {
            if let Err(error) = producer.stop().await {
                error!("Failed to stop producer for system '{system}': {error:#}");
            }
        }
    }

    /// Encode and hand one envelope to its destination system
    pub async fn send(&mut self, source: &str, envelope: OutgoingEnvelope) -> Result<()> {
        let encoded = self
            .serdes
            .encode(&envelope)
            .with_context(|| format!("encoding outbound envelope for {}", envelope.system_stream))?;
        let system = encoded.system_stream.system.clone();
        let Some(producer) = self.producers.get_mut(&system) else {
            bail!("no producer for system '{system}'");
        };
        producer.send(source, encoded).await?;
        self.sends.inc();
        Ok(())
    }

    /// Block until everything accepted from this source is durable
    pub async fn flush(&mut self, source: &str) -> Result<()> {
        for (system, producer) in self.producers.iter_mut() {
            producer
                .flush(source)
                .await
                .with_context(|| format!("flushing producer for system '{system}'"))?;
        }
        self.flushes.inc();
        Ok(())
    }
}
