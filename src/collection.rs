// src/collection.rs
//! Collection stage: one job per fetched item, published as a `raw` message
//! on `news.raw` with bounded retries and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use uuid::Uuid;

use crate::broker::MessageQueue;
use crate::config::CollectorConfig;
use crate::error::{PipelineError, Result};
use crate::model::{routes, NewsItem, NewsMessage};
use crate::pool::{Job, JobHandler, PoolConfig, PoolStats, WorkerPool};
use crate::shutdown::Shutdown;

pub const BACKOFF_FACTOR: f64 = 1.5;
pub const MAX_BACKOFF_MULTIPLIER: f64 = 60.0;

/// Order in which a tick's items are handed to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Breaking headlines are urgent; items published within the last hour
    /// are high and ones older than a day are low. Undated items are normal.
    pub fn of(item: &NewsItem, now: DateTime<Utc>) -> Self {
        if crate::transform::sentiment::is_urgent(&item.title.to_lowercase()) {
            return Self::Urgent;
        }
        match item.published_at.map(|at| now - at) {
            Some(age) if age <= chrono::Duration::hours(1) => Self::High,
            Some(age) if age > chrono::Duration::hours(24) => Self::Low,
            _ => Self::Normal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionJob {
    pub id: String,
    pub source: String,
    pub item: NewsItem,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub run_count: u32,
}

impl CollectionJob {
    pub fn new(source: &str, item: NewsItem) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            priority: Priority::of(&item, created_at),
            item,
            created_at,
            run_count: 0,
        }
    }
}

impl Job for CollectionJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::validation("job id cannot be empty"));
        }
        if self.source.trim().is_empty() {
            return Err(PipelineError::validation("job source cannot be empty"));
        }
        if self.item.id.trim().is_empty() {
            return Err(PipelineError::validation("news item id cannot be empty"));
        }
        if self.item.title.trim().is_empty() {
            return Err(PipelineError::validation("news item title cannot be empty"));
        }
        Ok(())
    }
}

/// Delay before retry `attempt` (1-based): `base * 1.5^attempt`, capped at
/// 60x `base`. Attempt 0 never waits.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = BACKOFF_FACTOR
        .powi(attempt.min(64) as i32)
        .min(MAX_BACKOFF_MULTIPLIER);
    base.mul_f64(factor)
}

/// Publishes one collected item, retrying failed publishes.
struct Publisher {
    broker: Arc<dyn MessageQueue>,
    job_timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
    /// Retry budget stamped on outgoing messages.
    message_max_retry: u32,
    metrics_enabled: bool,
    shutdown: Shutdown,
}

impl Publisher {
    async fn publish_with_retries(&self, job: &mut CollectionJob) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..self.attempts.max(1) {
            if attempt > 0 {
                let delay = backoff_delay(self.retry_delay, attempt);
                tracing::debug!(target: "collection", job = %job.id, attempt, ?delay, "retrying job");
                if !self.shutdown.sleep(delay).await {
                    return Err(PipelineError::Cancelled);
                }
            }
            job.run_count += 1;
            let msg = NewsMessage::raw(&job.source, job.item.clone(), self.message_max_retry);
            match self.broker.publish(routes::RAW, &msg).await {
                Ok(()) => {
                    tracing::debug!(target: "collection", job = %job.id, source = %job.source, attempts = attempt + 1, "job published");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(target: "collection", error = %e, job = %job.id, attempt = attempt + 1, "publish attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let reason = last_err
            .map(|e| format!("{e:#}"))
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(PipelineError::Publish {
            route: routes::RAW.to_string(),
            reason: format!("gave up after {} attempts: {reason}", self.attempts.max(1)),
        })
    }
}

#[async_trait::async_trait]
impl JobHandler<CollectionJob> for Publisher {
    async fn handle(&self, mut job: CollectionJob) -> Result<()> {
        let res = match tokio::time::timeout(self.job_timeout, self.publish_with_retries(&mut job)).await {
            Ok(r) => r,
            Err(_) => Err(PipelineError::Timeout {
                what: format!("collection job {}", job.id),
                after: self.job_timeout,
            }),
        };
        let outcome = if res.is_ok() { "ok" } else { "error" };
        if self.metrics_enabled {
            counter!("collection_jobs_total", "source" => job.source.clone(), "outcome" => outcome)
                .increment(1);
        }
        if let Err(e) = &res {
            tracing::error!(target: "collection", error = %e, job = %job.id, source = %job.source, "job failed permanently");
        }
        res
    }
}

pub struct CollectionWorkerPool {
    pool: WorkerPool<CollectionJob>,
    handler: Arc<Publisher>,
}

impl CollectionWorkerPool {
    pub fn new(
        cfg: &CollectorConfig,
        message_max_retry: u32,
        broker: Arc<dyn MessageQueue>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            pool: WorkerPool::new(
                PoolConfig {
                    name: "collection",
                    worker_count: cfg.worker_count,
                    queue_size: cfg.queue_size,
                    metrics_enabled: cfg.metrics_enabled,
                },
                shutdown.clone(),
            ),
            handler: Arc::new(Publisher {
                broker,
                job_timeout: cfg.job_timeout,
                attempts: cfg.retry_attempts,
                retry_delay: cfg.retry_delay,
                message_max_retry,
                metrics_enabled: cfg.metrics_enabled,
                shutdown,
            }),
        }
    }

    pub fn start(&self) {
        self.pool.start(self.handler.clone());
    }

    /// Non-blocking. Invalid jobs are never enqueued.
    pub fn submit_job(&self, job: CollectionJob) -> Result<()> {
        self.pool.submit(job)
    }

    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
