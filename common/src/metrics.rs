//! Process-local metrics: named counters and gauges, snapshots, reporters
//!
//! Registries are cheap clones over shared atomics; one registry per
//! container and one per task, keyed by source name.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use config::Config;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Monotonic counter handle
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-value gauge handle
#[derive(Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Named metric table for one source (container or task)
#[derive(Clone)]
pub struct MetricsRegistry {
    source: String,
    counters: Arc<DashMap<String, Counter>>,
    gauges: Arc<DashMap<String, Gauge>>,
}

impl MetricsRegistry {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            counters: Arc::new(DashMap::new()),
            gauges: Arc::new(DashMap::new()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get-or-create; handles stay valid for the registry's lifetime
    pub fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_string()).or_default().clone()
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauges.entry(name.to_string()).or_default().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            source: self.source.clone(),
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().get()))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().get()))
                .collect(),
        }
    }
}

/// Point-in-time view of one registry; also the diagnostics document
/// served over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub source: String,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

/// Pluggable reporter backend receiving periodic snapshots
#[async_trait]
pub trait MetricsReporter: Send {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn report(&mut self, snapshot: &MetricsSnapshot) -> Result<()>;

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds a reporter from `metrics.reporter.<name>.class`
pub trait MetricsReporterFactory: Send + Sync {
    fn build(&self, name: &str, config: &Config) -> Result<Box<dyn MetricsReporter>>;
}
