// src/processing.rs
//! Processing stage: `news.raw` messages are deduplicated, enriched, stored,
//! indexed and announced on `news.processed`. Hard failures go to
//! `news.retry` with a growing delay until the retry budget is spent, then to
//! `news.failed` and the dead-letter log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::boundary::guarded;
use crate::broker::{MessageHandler, MessageQueue};
use crate::config::ProcessorConfig;
use crate::dedup::{Admission, Deduplicator, DuplicateTier};
use crate::error::{PipelineError, Result};
use crate::model::{routes, DeadLetterMessage, MessageType, NewsItem, NewsMessage, ProcessingResult};
use crate::pool::{Job, JobHandler, PoolConfig, PoolStats, WorkerPool};
use crate::shutdown::Shutdown;
use crate::store::{NewsStore, SearchIndex};
use crate::transform::TransformerChain;

pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("processing_messages_total", "Processed messages by outcome.");
        describe_counter!("processing_retries_total", "Messages sent to news.retry.");
        describe_counter!("processing_dead_letters_total", "Messages dead-lettered.");
        describe_counter!("retry_relay_total", "Retry messages moved back to news.raw.");
        describe_histogram!("processing_ms", "End-to-end processing time per message in milliseconds.");
    });
}

impl Job for NewsMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<()> {
        NewsMessage::validate(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Stored(NewsItem),
    Duplicate(DuplicateTier),
}

/// Per-message work, without any retry policy.
pub struct Pipeline {
    dedup: Deduplicator,
    chain: TransformerChain,
    store: Arc<dyn NewsStore>,
    index: Arc<dyn SearchIndex>,
    broker: Arc<dyn MessageQueue>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn NewsStore>,
        index: Arc<dyn SearchIndex>,
        broker: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(store.clone()),
            chain: TransformerChain::default(),
            store,
            index,
            broker,
        }
    }

    pub fn with_chain(mut self, chain: TransformerChain) -> Self {
        self.chain = chain;
        self
    }

    pub async fn run(&self, msg: &NewsMessage) -> Result<Outcome> {
        let mut item = msg.data.clone();
        let claim = match self.dedup.admit(&mut item).await? {
            Admission::Duplicate(tier) => {
                tracing::info!(target: "processing", id = %msg.id, tier = tier.as_str(), "duplicate article, skipping");
                return Ok(Outcome::Duplicate(tier));
            }
            Admission::Unique(claim) => claim,
        };

        let item = self.chain.apply(item);

        self.store
            .create_news(&item)
            .await
            .map_err(|e| PipelineError::process(format!("saving {}: {e:#}", item.id)))?;
        // stored, so later twins are caught by the store lookup
        drop(claim);

        if let Err(e) = self.index.index_news(&item).await {
            tracing::warn!(target: "processing", id = %item.id, error = %e, "search indexing failed");
        }

        let mut processed = msg.clone();
        processed.kind = MessageType::Processed;
        processed.data = item.clone();
        processed.timestamp = Utc::now();
        processed.metadata.processing_stage = "processed".to_string();
        if let Err(e) = self.broker.publish(routes::PROCESSED, &processed).await {
            tracing::warn!(target: "processing", id = %item.id, error = %e, "publishing processed message failed");
        }

        tracing::info!(target: "processing", id = %item.id, category = %item.category, "article processed");
        Ok(Outcome::Stored(item))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Republish on `news.retry`; `timestamp` holds the earliest redelivery.
    Retry(NewsMessage),
    /// Terminal: `news.failed` plus the dead-letter log.
    DeadLetter(NewsMessage),
}

/// Decides what happens to a message whose processing just failed.
///
/// `failures = retry + 1`. Below the budget the message is rescheduled
/// `retry_delay * failures` from `now`; at the budget it becomes `failed`.
/// Messages without a budget of their own use `default_max`.
pub fn disposition(
    mut msg: NewsMessage,
    retryable: bool,
    default_max: u32,
    retry_delay: Duration,
    now: DateTime<Utc>,
) -> Disposition {
    let max = if msg.max_retry == 0 { default_max.max(1) } else { msg.max_retry };
    msg.max_retry = max;
    let failures = msg.retry.saturating_add(1);
    if retryable && failures < max {
        msg.retry = failures;
        let wait = chrono::Duration::from_std(retry_delay.saturating_mul(failures))
            .unwrap_or_else(|_| chrono::Duration::zero());
        msg.timestamp = now.checked_add_signed(wait).unwrap_or(now);
        Disposition::Retry(msg)
    } else {
        msg.retry = max;
        msg.kind = MessageType::Failed;
        Disposition::DeadLetter(msg)
    }
}

/// Bounded in-memory record of dead-lettered messages, oldest evicted first.
#[derive(Debug)]
pub struct DeadLetterLog {
    inner: Mutex<VecDeque<DeadLetterMessage>>,
    cap: usize,
}

impl DeadLetterLog {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 100_000);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
        }
    }

    pub fn record(&self, entry: DeadLetterMessage) {
        let mut v = self.inner.lock().expect("dead letter mutex poisoned");
        v.push_back(entry);
        while v.len() > self.cap {
            v.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<DeadLetterMessage> {
        self.inner
            .lock()
            .expect("dead letter mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dead letter mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingCounts {
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

struct Processing {
    pipeline: Arc<Pipeline>,
    broker: Arc<dyn MessageQueue>,
    dead_letters: Arc<DeadLetterLog>,
    counters: Counters,
    job_timeout: Duration,
    max_retry: u32,
    retry_delay: Duration,
    metrics_enabled: bool,
}

impl Processing {
    async fn process(&self, msg: NewsMessage) -> ProcessingResult {
        let t0 = Instant::now();
        let pipeline = self.pipeline.clone();
        let limit = self.job_timeout;
        let work = msg.clone();
        let res = guarded(&format!("processing:{}", msg.id), async move {
            match tokio::time::timeout(limit, pipeline.run(&work)).await {
                Ok(r) => r,
                Err(_) => Err(PipelineError::Timeout {
                    what: format!("processing message {}", work.id),
                    after: limit,
                }),
            }
        })
        .await;
        let duration = t0.elapsed();
        if self.metrics_enabled {
            histogram!("processing_ms").record(duration.as_secs_f64() * 1_000.0);
        }

        let message_id = msg.id.clone();
        match res {
            Ok(outcome) => {
                let duplicate = matches!(outcome, Outcome::Duplicate(_));
                let (label, slot) = if duplicate {
                    ("duplicate", &self.counters.duplicates)
                } else {
                    ("stored", &self.counters.processed)
                };
                slot.fetch_add(1, Ordering::Relaxed);
                if self.metrics_enabled {
                    counter!("processing_messages_total", "outcome" => label).increment(1);
                }
                ProcessingResult {
                    message_id,
                    success: true,
                    duplicate,
                    error: None,
                    duration,
                }
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if self.metrics_enabled {
                    counter!("processing_messages_total", "outcome" => "error").increment(1);
                }
                tracing::error!(target: "processing", id = %message_id, retry = msg.retry, error = %e, "processing failed");
                let reason = e.to_string();
                self.fail(msg, &e).await;
                ProcessingResult {
                    message_id,
                    success: false,
                    duplicate: false,
                    error: Some(reason),
                    duration,
                }
            }
        }
    }

    async fn fail(&self, msg: NewsMessage, err: &PipelineError) {
        let now = Utc::now();
        let failures = msg.retry.saturating_add(1);
        match disposition(msg, err.is_retryable(), self.max_retry, self.retry_delay, now) {
            Disposition::Retry(next) => match self.broker.publish(routes::RETRY, &next).await {
                Ok(()) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    if self.metrics_enabled {
                        counter!("processing_retries_total").increment(1);
                    }
                    tracing::info!(target: "processing", id = %next.id, retry = next.retry, not_before = %next.timestamp, "scheduled for retry");
                }
                Err(e) => {
                    tracing::error!(target: "processing", id = %next.id, error = %e, "publishing retry failed, dead-lettering");
                    let reason = format!("{err}; retry publish failed: {e:#}");
                    self.dead_letter(next, reason, failures, now);
                }
            },
            Disposition::DeadLetter(last) => {
                if let Err(e) = self.broker.publish(routes::FAILED, &last).await {
                    tracing::error!(target: "processing", id = %last.id, error = %e, "publishing failed message failed");
                }
                self.dead_letter(last, err.to_string(), failures, now);
            }
        }
    }

    fn dead_letter(&self, msg: NewsMessage, reason: String, failures: u32, now: DateTime<Utc>) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if self.metrics_enabled {
            counter!("processing_dead_letters_total").increment(1);
        }
        tracing::warn!(target: "processing", id = %msg.id, failures, reason = %reason, "message dead-lettered");
        self.dead_letters.record(DeadLetterMessage {
            id: Uuid::new_v4().to_string(),
            original_message: msg,
            failure_reason: reason,
            failure_count: failures,
            last_attempt: now,
            created_at: now,
        });
    }
}

#[async_trait::async_trait]
impl JobHandler<NewsMessage> for Processing {
    async fn handle(&self, msg: NewsMessage) -> Result<()> {
        let result = self.process(msg).await;
        tracing::debug!(target: "processing", id = %result.message_id, success = result.success, duplicate = result.duplicate, elapsed = ?result.duration, "message done");
        match result.error {
            None => Ok(()),
            Some(reason) => Err(PipelineError::TransientProcess(reason)),
        }
    }
}

pub struct ProcessingWorkerPool {
    pool: WorkerPool<NewsMessage>,
    handler: Arc<Processing>,
}

impl ProcessingWorkerPool {
    pub fn new(
        cfg: &ProcessorConfig,
        pipeline: Pipeline,
        broker: Arc<dyn MessageQueue>,
        shutdown: Shutdown,
    ) -> Self {
        ensure_metrics_described();
        Self {
            pool: WorkerPool::new(
                PoolConfig {
                    name: "processing",
                    worker_count: cfg.worker_count,
                    queue_size: cfg.queue_size,
                    metrics_enabled: cfg.metrics_enabled,
                },
                shutdown,
            ),
            handler: Arc::new(Processing {
                pipeline: Arc::new(pipeline),
                broker,
                dead_letters: Arc::new(DeadLetterLog::with_capacity(cfg.dead_letter_capacity)),
                counters: Counters::default(),
                job_timeout: cfg.job_timeout,
                max_retry: cfg.max_retry,
                retry_delay: cfg.retry_delay,
                metrics_enabled: cfg.metrics_enabled,
            }),
        }
    }

    pub fn start(&self) {
        self.pool.start(self.handler.clone());
    }

    pub fn submit(&self, msg: NewsMessage) -> Result<()> {
        self.pool.submit(msg)
    }

    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn counts(&self) -> ProcessingCounts {
        let c = &self.handler.counters;
        ProcessingCounts {
            processed: c.processed.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterMessage> {
        self.handler.dead_letters.snapshot()
    }
}

/// Feeds `news.raw` into the processing pool.
pub struct ProcessingConsumer {
    pool: Arc<ProcessingWorkerPool>,
}

impl ProcessingConsumer {
    pub fn new(pool: Arc<ProcessingWorkerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageHandler for ProcessingConsumer {
    async fn handle(&self, body: &[u8]) -> Result<()> {
        let msg = NewsMessage::from_bytes(body)
            .map_err(|e| PipelineError::validation(format!("undecodable message: {e}")))?;
        let id = msg.id.clone();
        self.pool.submit(msg).map_err(|e| {
            if e.is_backpressure() {
                tracing::warn!(target: "processing", id = %id, "processing queue full, rejecting message");
            }
            e
        })
    }
}

/// Moves due `news.retry` messages back onto `news.raw`.
pub struct RetryRelay {
    broker: Arc<dyn MessageQueue>,
    shutdown: Shutdown,
}

impl RetryRelay {
    pub fn new(broker: Arc<dyn MessageQueue>, shutdown: Shutdown) -> Self {
        Self { broker, shutdown }
    }
}

#[async_trait::async_trait]
impl MessageHandler for RetryRelay {
    async fn handle(&self, body: &[u8]) -> Result<()> {
        let msg = NewsMessage::from_bytes(body)
            .map_err(|e| PipelineError::validation(format!("undecodable retry message: {e}")))?;
        if let Ok(wait) = (msg.timestamp - Utc::now()).to_std() {
            if !self.shutdown.sleep(wait).await {
                return Err(PipelineError::Cancelled);
            }
        }
        self.broker
            .publish(routes::RAW, &msg)
            .await
            .map_err(|e| PipelineError::Publish {
                route: routes::RAW.to_string(),
                reason: format!("{e:#}"),
            })?;
        counter!("retry_relay_total").increment(1);
        tracing::debug!(target: "processing", id = %msg.id, retry = msg.retry, "retry released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::store::{MemoryIndex, MemoryStore};

    fn msg(id: &str, title: &str) -> NewsMessage {
        NewsMessage::raw(
            "wire",
            NewsItem {
                id: id.into(),
                title: title.into(),
                content: format!("{title} body text"),
                url: format!("https://example.com/{id}"),
                ..Default::default()
            },
            3,
        )
    }

    #[test]
    fn disposition_follows_retry_budget() {
        let now = Utc::now();
        let delay = Duration::from_secs(60);
        let Disposition::Retry(first) = disposition(msg("a", "t"), true, 3, delay, now) else {
            panic!("expected retry")
        };
        assert_eq!(first.retry, 1);
        assert_eq!(first.timestamp, now + chrono::Duration::seconds(60));

        let Disposition::Retry(second) = disposition(first, true, 3, delay, now) else {
            panic!("expected retry")
        };
        assert_eq!(second.retry, 2);
        assert_eq!(second.timestamp, now + chrono::Duration::seconds(120));

        let Disposition::DeadLetter(last) = disposition(second, true, 3, delay, now) else {
            panic!("expected dead letter")
        };
        assert_eq!(last.retry, 3);
        assert_eq!(last.kind, MessageType::Failed);
    }

    #[test]
    fn terminal_errors_skip_retries_and_zero_budget_uses_default() {
        let mut m = msg("a", "t");
        m.max_retry = 0;
        match disposition(m.clone(), false, 3, Duration::from_secs(1), Utc::now()) {
            Disposition::DeadLetter(d) => assert_eq!(d.max_retry, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            disposition(m, true, 3, Duration::from_secs(1), Utc::now()),
            Disposition::Retry(_)
        ));
    }

    #[test]
    fn dead_letter_log_is_bounded() {
        let log = DeadLetterLog::with_capacity(2);
        for id in ["a", "b", "c"] {
            log.record(DeadLetterMessage {
                id: id.into(),
                original_message: msg(id, "t"),
                failure_reason: "x".into(),
                failure_count: 3,
                last_attempt: Utc::now(),
                created_at: Utc::now(),
            });
        }
        let ids: Vec<_> = log.snapshot().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn pipeline_stores_once_and_skips_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let broker = Arc::new(InMemoryBroker::new());
        let pipeline = Pipeline::new(store.clone(), index.clone(), broker.clone());

        let first = pipeline.run(&msg("a", "Rates hold steady")).await.unwrap();
        assert!(matches!(first, Outcome::Stored(_)));
        // same url, different id
        let mut again = msg("b", "Rates hold steady");
        again.data.url = "https://example.com/a".into();
        assert!(matches!(pipeline.run(&again).await.unwrap(), Outcome::Duplicate(_)));

        assert_eq!(store.len(), 1);
        assert_eq!(index.indexed(), vec!["a".to_string()]);
        let out = broker.published(routes::PROCESSED);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, MessageType::Processed);
        assert_eq!(out[0].data.author, "Unknown");
    }

    #[tokio::test]
    async fn index_and_publish_failures_are_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        index.set_fail(true);
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_fail_publish(routes::PROCESSED, true);
        let pipeline = Pipeline::new(store.clone(), index, broker);
        assert!(matches!(
            pipeline.run(&msg("a", "Quiet day")).await.unwrap(),
            Outcome::Stored(_)
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn store_failure_goes_to_retry_queue() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let broker = Arc::new(InMemoryBroker::new());
        let pool = ProcessingWorkerPool::new(
            &ProcessorConfig {
                worker_count: 1,
                ..Default::default()
            },
            Pipeline::new(store, Arc::new(MemoryIndex::new()), broker.clone()),
            broker.clone(),
            Shutdown::new(),
        );
        pool.start();
        pool.submit(msg("a", "Rates hold steady")).unwrap();
        pool.stop().await;

        let retried = broker.published(routes::RETRY);
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].retry, 1);
        assert!(retried[0].timestamp > Utc::now());
        let counts = pool.counts();
        assert_eq!((counts.failed, counts.retried, counts.dead_lettered), (1, 1, 0));
        assert_eq!(pool.stats().failed_jobs, 1);
    }

    #[tokio::test]
    async fn root_shutdown_closes_processing_ingress() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let root = Shutdown::new();
        let pool = Arc::new(ProcessingWorkerPool::new(
            &ProcessorConfig::default(),
            Pipeline::new(store.clone(), Arc::new(MemoryIndex::new()), broker.clone()),
            broker,
            root.clone(),
        ));
        pool.start();
        root.trigger();
        let consumer = ProcessingConsumer::new(pool.clone());
        let body = msg("a", "Markets open higher").to_bytes().unwrap();
        assert!(matches!(consumer.handle(&body).await, Err(PipelineError::PoolClosed(_))));
        pool.stop().await;
        assert_eq!(pool.stats().total_jobs, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn consumer_rejects_garbage_as_validation() {
        let broker = Arc::new(InMemoryBroker::new());
        let pool = Arc::new(ProcessingWorkerPool::new(
            &ProcessorConfig::default(),
            Pipeline::new(Arc::new(MemoryStore::new()), Arc::new(MemoryIndex::new()), broker.clone()),
            broker,
            Shutdown::new(),
        ));
        let consumer = ProcessingConsumer::new(pool.clone());
        let err = consumer.handle(b"{not json").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        // not started yet
        let body = msg("a", "t").to_bytes().unwrap();
        assert!(matches!(consumer.handle(&body).await, Err(PipelineError::PoolClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn relay_waits_for_due_time() {
        let broker = Arc::new(InMemoryBroker::new());
        let relay = RetryRelay::new(broker.clone(), Shutdown::new());
        let mut m = msg("a", "t");
        m.retry = 1;
        m.timestamp = Utc::now() + chrono::Duration::seconds(5);
        let body = m.to_bytes().unwrap();

        let t0 = tokio::time::Instant::now();
        relay.handle(&body).await.unwrap();
        assert!(t0.elapsed() >= Duration::from_secs(4));
        let raw = broker.published(routes::RAW);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].retry, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_sleep_is_cancelled_by_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let root = Shutdown::new();
        let relay = RetryRelay::new(broker.clone(), root.clone());
        let mut m = msg("a", "t");
        m.timestamp = Utc::now() + chrono::Duration::hours(1);
        let body = m.to_bytes().unwrap();
        root.trigger();
        assert!(matches!(relay.handle(&body).await, Err(PipelineError::Cancelled)));
        assert!(broker.published(routes::RAW).is_empty());
    }
}
