//! News pipeline binary.
//! Loads config, wires collector and processor around the in-process broker,
//! serves `/metrics` and runs until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use news_pipeline::broker::{InMemoryBroker, MessageQueue};
use news_pipeline::config;
use news_pipeline::metrics::Metrics;
use news_pipeline::registry::SourceRegistry;
use news_pipeline::store::{MemoryIndex, MemoryStore};
use news_pipeline::{Collector, Processor, Shutdown};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` wins; otherwise info for this crate and warn elsewhere.
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("news_pipeline=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default().context("loading pipeline config")?;
    tracing::info!(
        sources = cfg.sources.len(),
        collector_workers = cfg.collector.worker_count,
        processor_workers = cfg.processor.worker_count,
        "configuration loaded"
    );

    let root = Shutdown::new();

    let metrics_task = if cfg.metrics.enabled {
        let metrics = Metrics::install()?;
        let port = cfg.metrics.port;
        let stop = root.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics.serve(port, stop).await {
                tracing::error!(error = ?e, "metrics server failed");
            }
        }))
    } else {
        None
    };

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());

    let processor = Processor::new(&cfg.processor, store, index, broker.clone(), root.clone());
    processor.start().await.context("starting processor")?;

    let collector = Collector::new(&cfg, SourceRegistry::new(), broker.clone(), root.clone());
    collector.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    root.trigger();
    collector.stop().await;
    processor.stop().await;
    if let Err(e) = broker.close().await {
        tracing::warn!(error = ?e, "closing broker failed");
    }
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    let c = collector.metrics();
    let p = processor.metrics();
    tracing::info!(
        collected = c.successful_jobs,
        processed = p.counts.processed,
        duplicates = p.counts.duplicates,
        dead_letters = p.dead_letters,
        "pipeline stopped"
    );
    Ok(())
}
