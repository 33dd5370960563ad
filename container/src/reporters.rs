//! Metrics reporters: the built-in log reporter and the background task
//! that feeds snapshots to whatever reporters are configured

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use config::Config;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use weir_common::metrics::{
    MetricsRegistry, MetricsReporter, MetricsReporterFactory, MetricsSnapshot,
};

/// Emits snapshots through tracing
pub struct LogReporter;

#[async_trait]
impl MetricsReporter for LogReporter {
    async fn report(&mut self, snapshot: &MetricsSnapshot) -> Result<()> {
        info!(
            source = %snapshot.source,
            counters = ?snapshot.counters,
            gauges = ?snapshot.gauges,
            "Metrics snapshot"
        );
        Ok(())
    }
}

pub struct LogReporterFactory;

impl MetricsReporterFactory for LogReporterFactory {
    fn build(&self, _name: &str, _config: &Config) -> Result<Box<dyn MetricsReporter>> {
        Ok(Box::new(LogReporter))
    }
}

/// Background cadence loop owning the configured reporters for the
/// container's lifetime. Reporter failures are logged, never fatal.
pub struct ReporterSet {
    handle: Option<JoinHandle<()>>,
    cancel: Option<watch::Sender<bool>>,
}

impl ReporterSet {
    pub fn spawn(
        mut reporters: Vec<Box<dyn MetricsReporter>>,
        registries: Vec<MetricsRegistry>,
        interval: Duration,
    ) -> Self {
        if reporters.is_empty() {
            return Self { handle: None, cancel: None };
        }
        let (cancel, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            for reporter in reporters.iter_mut() {
                if let Err(error) = reporter.start().await {
                    error!("Failed to start metrics reporter: {error:#}");
                }
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for registry in &registries {
                            let snapshot = registry.snapshot();
                            for reporter in reporters.iter_mut() {
                                if let Err(error) = reporter.report(&snapshot).await {
                                    warn!("Metrics reporter failed: {error:#}");
                                }
                            }
                        }
                    }
                    _ = cancelled.changed() => break,
                }
            }
            for reporter in reporters.iter_mut() {
                if let Err(error) = reporter.stop().await {
                    error!("Failed to stop metrics reporter: {error:#}");
                }
            }
        });
        Self {
            handle: Some(handle),
            cancel: Some(cancel),
        }
    }

    pub async fn stop(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
