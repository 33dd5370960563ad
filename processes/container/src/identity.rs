//! Identity task: echoes every input envelope to a configured output
//! stream, mirroring the input partition

use anyhow::{Context, Result};
use async_trait::async_trait;
use config::Config;

use weir_common::task::{Collector, Coordinator, StreamTask, TaskContext, TaskFactory};
use weir_common::{IncomingEnvelope, OutgoingEnvelope, SystemStream};

const OUTPUT_KEY: &str = "task.identity.output";

pub struct IdentityTask {
    output: SystemStream,
}

#[async_trait]
impl StreamTask for IdentityTask {
    async fn process(
        &mut self,
        envelope: &IncomingEnvelope,
        ctx: &mut TaskContext<'_>,
        collector: &mut Collector,
        _coordinator: &mut Coordinator,
    ) -> Result<()> {
        collector.send(
            OutgoingEnvelope::new(
                self.output.clone(),
                envelope.key.clone(),
                envelope.value.clone(),
            )
            .with_partition(ctx.partition),
        );
        Ok(())
    }
}

pub struct IdentityTaskFactory;

impl TaskFactory for IdentityTaskFactory {
    fn build(&self, config: &Config) -> Result<Box<dyn StreamTask>> {
        let spec = config
            .get_string(OUTPUT_KEY)
            .with_context(|| format!("identity task needs '{OUTPUT_KEY}'"))?;
        let output = SystemStream::parse(&spec)?;
        Ok(Box::new(IdentityTask { output }))
    }
}
