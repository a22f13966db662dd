// src/metrics.rs
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::shutdown::Shutdown;

/// Registers HELP text for every series the pipeline emits. Safe to call
/// repeatedly.
pub fn describe_all() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pool_jobs_total", "Jobs finished by a worker pool, by outcome.");
        describe_counter!("pool_rejected_total", "Submissions refused by a worker pool, by reason.");
        describe_gauge!("pool_active_workers", "Workers currently running a job.");
        describe_gauge!("pool_pending", "Jobs queued or running.");
        describe_histogram!("pool_job_ms", "Job run time in milliseconds.");
        describe_counter!("collection_jobs_total", "Collection jobs by source and outcome.");
        describe_counter!("broker_published_total", "Messages published, by route.");
        describe_counter!("broker_requeued_total", "Deliveries requeued after backpressure.");
        describe_counter!("broker_dropped_total", "Deliveries rejected and dropped.");
        describe_histogram!("scheduler_tick_ms", "Scheduled collection run time in milliseconds.");
        describe_counter!("scheduler_tick_failures_total", "Failed scheduled collections, by source.");
        describe_counter!("transformer_failures_total", "Transformer stages skipped after an error.");
        describe_counter!("pipeline_panics_recovered_total", "Panics caught at task boundaries.");
    });
    crate::source::ensure_metrics_described();
    crate::processing::ensure_metrics_described();
}

pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the global Prometheus recorder. Fails if one is already set.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing prometheus recorder")?;
        describe_all();
        Ok(Self { handle })
    }

    pub fn from_handle(handle: PrometheusHandle) -> Self {
        Self { handle }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }

    /// Serves [`Metrics::router`] on `0.0.0.0:port` until `shutdown` fires.
    pub async fn serve(&self, port: u16, shutdown: Shutdown) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;
        tracing::info!(%addr, "metrics endpoint listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("metrics server")
    }
}
