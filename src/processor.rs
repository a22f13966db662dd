// src/processor.rs
//! Processing side: consumes `news.raw` into the processing pool and runs the
//! retry relay on `news.retry`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::broker::MessageQueue;
use crate::config::ProcessorConfig;
use crate::error::{PipelineError, Result};
use crate::model::{routes, DeadLetterMessage};
use crate::pool::PoolStats;
use crate::processing::{
    Pipeline, ProcessingConsumer, ProcessingCounts, ProcessingWorkerPool, RetryRelay,
};
use crate::shutdown::Shutdown;
use crate::store::{NewsStore, SearchIndex};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorMetrics {
    pub pool: PoolStats,
    pub counts: ProcessingCounts,
    pub dead_letters: usize,
}

pub struct Processor {
    pool: Arc<ProcessingWorkerPool>,
    broker: Arc<dyn MessageQueue>,
    shutdown: Shutdown,
    running: AtomicBool,
}

impl Processor {
    pub fn new(
        cfg: &ProcessorConfig,
        store: Arc<dyn NewsStore>,
        index: Arc<dyn SearchIndex>,
        broker: Arc<dyn MessageQueue>,
        shutdown: Shutdown,
    ) -> Self {
        Self::with_pipeline(cfg, Pipeline::new(store, index, broker.clone()), broker, shutdown)
    }

    pub fn with_pipeline(
        cfg: &ProcessorConfig,
        pipeline: Pipeline,
        broker: Arc<dyn MessageQueue>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            pool: Arc::new(ProcessingWorkerPool::new(
                cfg,
                pipeline,
                broker.clone(),
                shutdown.clone(),
            )),
            broker,
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Starts the workers, then attaches the `news.raw` and `news.retry`
    /// consumers.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::validation("processor is already running"));
        }
        self.pool.start();
        self.broker
            .consume(routes::RAW, Arc::new(ProcessingConsumer::new(self.pool.clone())))
            .await?;
        self.broker
            .consume(
                routes::RETRY,
                Arc::new(RetryRelay::new(self.broker.clone(), self.shutdown.clone())),
            )
            .await?;
        tracing::info!(target: "processor", "processor started");
        Ok(())
    }

    /// Closes pool ingress and waits for queued messages to finish. Consumers
    /// see `PoolClosed` and stop on their next delivery.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!(target: "processor", "processor is not running");
            return;
        }
        self.pool.stop().await;
        tracing::info!(target: "processor", "processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        let dead = self.pool.dead_letters().len();
        ProcessorMetrics {
            pool: self.pool.stats(),
            counts: self.pool.counts(),
            dead_letters: dead,
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterMessage> {
        self.pool.dead_letters()
    }
}
