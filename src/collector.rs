// src/collector.rs
//! Collection side: the registry's sources are ticked by the scheduler and
//! every fetched item becomes a job on the collection pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::broker::MessageQueue;
use crate::collection::{backoff_delay, CollectionJob, CollectionWorkerPool};
use crate::config::{AppConfig, SourceConfig};
use crate::error::{PipelineError, Result};
use crate::model::NewsItem;
use crate::registry::{RegistryError, SourceRegistry, SourceStatus};
use crate::scheduler::{tick_handler, JobScheduler, ScheduleInfo, SchedulerError, TickHandler};
use crate::shutdown::Shutdown;
use crate::source::Source;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorMetrics {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub average_job_time: Duration,
    pub active_sources: usize,
    pub queue_utilization: f64,
    pub last_collection: Option<DateTime<Utc>>,
}

/// Registry status merged with the scheduler's view of the source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    #[serde(flatten)]
    pub status: SourceStatus,
    pub schedule_info: Option<ScheduleInfo>,
}

pub struct Collector {
    registry: Arc<SourceRegistry>,
    scheduler: JobScheduler,
    pool: Arc<CollectionWorkerPool>,
    running: AtomicBool,
    last_collection: Arc<Mutex<Option<DateTime<Utc>>>>,
    grace: Duration,
    shutdown: Shutdown,
}

impl Collector {
    /// Registers the configured sources; bad entries are logged and skipped.
    pub fn new(
        cfg: &AppConfig,
        registry: SourceRegistry,
        broker: Arc<dyn MessageQueue>,
        shutdown: Shutdown,
    ) -> Self {
        let registry = registry.with_metrics(cfg.collector.metrics_enabled);
        if let Err(e) = registry.initialize(&cfg.sources) {
            tracing::warn!(target: "collector", error = %e, "some sources failed to initialize");
        }
        Self {
            registry: Arc::new(registry),
            scheduler: JobScheduler::new(shutdown.clone()),
            pool: Arc::new(CollectionWorkerPool::new(
                &cfg.collector,
                cfg.processor.max_retry,
                broker,
                shutdown.clone(),
            )),
            running: AtomicBool::new(false),
            last_collection: Arc::new(Mutex::new(None)),
            grace: cfg.collector.job_timeout,
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(target: "collector", "collector is already running");
            return;
        }
        self.pool.start();
        self.scheduler.start();
        for src in self.registry.sources() {
            if let Err(e) = self.schedule(src.clone()) {
                tracing::error!(target: "collector", error = %e, source = %src.name(), "failed to schedule source");
            }
        }
        tracing::info!(target: "collector", sources = self.registry.len(), "collector started");
    }

    /// Scheduler first so no new jobs arrive, then the pool drains.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!(target: "collector", "collector is not running");
            return;
        }
        self.scheduler.shutdown(self.grace).await;
        self.pool.stop().await;
        tracing::info!(target: "collector", "collector stopped");
    }

    fn schedule(&self, src: Arc<dyn Source>) -> std::result::Result<(), SchedulerError> {
        let name = src.name().to_string();
        let interval = src.schedule();
        self.scheduler
            .schedule_source(&name, interval, self.tick_for(src))
    }

    fn tick_for(&self, src: Arc<dyn Source>) -> TickHandler {
        let pool = self.pool.clone();
        let last = self.last_collection.clone();
        let shutdown = self.shutdown.clone();
        tick_handler(move || {
            collect_from(src.clone(), pool.clone(), last.clone(), shutdown.clone())
        })
    }

    /// Registers `cfg` and, while running, schedules it. A scheduling
    /// failure unregisters the source again.
    pub fn add_source(&self, cfg: &SourceConfig) -> std::result::Result<(), CollectorError> {
        self.registry.add_source(cfg)?;
        if self.is_running() {
            let Some(src) = self.registry.get(&cfg.name) else {
                return Err(RegistryError::NotFound(cfg.name.clone()).into());
            };
            if let Err(e) = self.schedule(src) {
                let _ = self.registry.remove_source(&cfg.name);
                return Err(e.into());
            }
        }
        tracing::info!(target: "collector", source = %cfg.name, "source added");
        Ok(())
    }

    /// Unschedules and unregisters `name`. A tick already running finishes.
    pub fn remove_source(&self, name: &str) -> std::result::Result<(), CollectorError> {
        if self.is_running() {
            if let Err(e) = self.scheduler.remove_source(name) {
                tracing::warn!(target: "collector", error = %e, source = %name, "source was not scheduled");
            }
        }
        self.registry.remove_source(name)?;
        tracing::info!(target: "collector", source = %name, "source removed");
        Ok(())
    }

    pub fn source_status(&self) -> BTreeMap<String, SourceReport> {
        let mut schedules = self.scheduler.all_schedule_info();
        self.registry
            .status()
            .into_iter()
            .map(|(name, status)| {
                let schedule_info = schedules.remove(&name);
                (name, SourceReport { status, schedule_info })
            })
            .collect()
    }

    pub fn metrics(&self) -> CollectorMetrics {
        let s = self.pool.stats();
        CollectorMetrics {
            total_jobs: s.total_jobs,
            successful_jobs: s.successful_jobs,
            failed_jobs: s.failed_jobs,
            average_job_time: s.average_job_time,
            active_sources: self.registry.len(),
            queue_utilization: s.utilization(),
            last_collection: *self.last_collection.lock().expect("collector mutex poisoned"),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }
}

/// Fetch, retrying transient failures up to the source's `max_retries` with
/// backoff from its `retry_delay`.
async fn fetch_with_retries(src: &dyn Source, shutdown: &Shutdown) -> Result<Vec<NewsItem>> {
    let spec = src.spec();
    let mut attempt = 0u32;
    loop {
        match src.fetch().await {
            Ok(items) => return Ok(items),
            Err(e) if e.is_retryable() && attempt < spec.max_retries => {
                attempt += 1;
                let delay = backoff_delay(spec.retry_delay, attempt);
                tracing::warn!(target: "collector", error = %e, source = %spec.name, attempt, ?delay, "fetch failed, retrying");
                if !shutdown.sleep(delay).await {
                    return Err(PipelineError::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// One scheduled collection: fetch, then one job per item. Items the pool
/// refuses are logged and skipped.
async fn collect_from(
    src: Arc<dyn Source>,
    pool: Arc<CollectionWorkerPool>,
    last: Arc<Mutex<Option<DateTime<Utc>>>>,
    shutdown: Shutdown,
) -> Result<()> {
    let t0 = Instant::now();
    let name = src.name().to_string();
    let items = fetch_with_retries(src.as_ref(), &shutdown).await?;
    *last.lock().expect("collector mutex poisoned") = Some(Utc::now());
    if items.is_empty() {
        tracing::debug!(target: "collector", source = %name, "no new items");
        return Ok(());
    }

    let total = items.len();
    let mut submitted = 0usize;
    let mut jobs: Vec<CollectionJob> = items.into_iter().map(|item| CollectionJob::new(&name, item)).collect();
    // stable, so feed order holds within a priority
    jobs.sort_by_key(|j| std::cmp::Reverse(j.priority));
    for job in jobs {
        let job_id = job.id.clone();
        let priority = job.priority;
        match pool.submit_job(job) {
            Ok(()) => submitted += 1,
            Err(e) => {
                tracing::warn!(target: "collector", error = %e, source = %name, job = %job_id, ?priority, "failed to submit collection job");
            }
        }
    }
    tracing::info!(target: "collector", source = %name, total, submitted, elapsed = ?t0.elapsed(), "collection completed");
    Ok(())
}
