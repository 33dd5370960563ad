//! 'main' for the Weir container process
//!
//! Launched as a subprocess by a workload manager with three environment
//! inputs: TASK_NAME (container id), CONFIG (JSON config document) and
//! PARTITION_IDS (comma list of owned partitions). Exits 0 on graceful
//! shutdown, nonzero on any fatal setup or run-loop error.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use config::{Config, Environment, File, FileFormat};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use weir_common::config::MetricsConfig;
use weir_common::metrics::{MetricsRegistry, MetricsSnapshot};
use weir_common::Partition;
use weir_container::{ComponentRegistry, Container};
use weir_module_fjall_store::FjallStorageEngineFactory;
use weir_module_memory_system::MemorySystemFactory;

mod identity;
use identity::IdentityTaskFactory;

#[derive(Debug, clap::Parser)]
#[command(name = "weir_process_container")]
struct Args {
    /// Container identifier; also the metrics source
    #[arg(long, env = "TASK_NAME")]
    task_name: String,

    /// Full configuration as one JSON document
    #[arg(long, env = "CONFIG")]
    config: String,

    /// Comma-separated partition ids owned by this container
    #[arg(long, env = "PARTITION_IDS")]
    partition_ids: String,
}

fn parse_partitions(raw: &str) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let id = part.parse::<u32>().with_context(|| format!("invalid partition id '{part}'"))?;
        partitions.push(Partition(id));
    }
    if partitions.is_empty() {
        bail!("PARTITION_IDS is empty; the container needs at least one partition");
    }
    Ok(partitions)
}

/// Everything the distribution ships, ready for config to name
fn default_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::with_defaults();
    registry.register_system_factory("memory", Arc::new(MemorySystemFactory::new()));
    registry.register_store_factory("fjall", Arc::new(FjallStorageEngineFactory));
    registry.register_task_factory("identity", Arc::new(IdentityTaskFactory));
    registry
}

async fn metrics_endpoint(
    State(registries): State<Vec<MetricsRegistry>>,
) -> Json<Vec<MetricsSnapshot>> {
    Json(registries.iter().map(MetricsRegistry::snapshot).collect())
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = <Args as clap::Parser>::parse();

    // Standard logging using RUST_LOG for log levels, default INFO
    let fmt_layer = fmt::layer()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info")));
    Registry::default().with(fmt_layer).init();

    info!("Weir container process '{}'", args.task_name);

    let partitions = parse_partitions(&args.partition_ids)?;
    let config = Arc::new(
        Config::builder()
            .add_source(File::from_str(&args.config, FileFormat::Json))
            .add_source(Environment::with_prefix("WEIR"))
            .build()
            .context("parsing CONFIG")?,
    );

    let registry = default_registry();
    let container = Container::build(&args.task_name, &partitions, config.clone(), &registry)?;

    // Diagnostics endpoint, up for the life of the process
    let metrics_config = MetricsConfig::new(config);
    let app = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .with_state(container.metrics_registries());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", metrics_config.port()))
        .await
        .with_context(|| format!("binding metrics port {}", metrics_config.port()))?;
    info!("Serving metrics on port {}", metrics_config.port());
    let metrics_server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            error!("Metrics endpoint failed: {error}");
        }
    });

    // Cooperative shutdown on interrupt, honored at iteration end
    let shutdown = container.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, requesting shutdown");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let result = container.run().await;
    metrics_server.abort();
    result
}
