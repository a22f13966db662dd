//! Error taxonomy for the collection and processing pipeline.
//!
//! Collaborators (broker, store, index, HTTP) report `anyhow::Error`; the
//! pipeline wraps them into [`PipelineError`] so retry and dead-letter
//! decisions can match on the kind of failure.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed source config, job or message. Never enters the pipeline.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fetching from a source failed; retried by the caller's policy.
    #[error("fetch from source `{source_name}` failed: {reason}")]
    TransientFetch { source_name: String, reason: String },

    /// A processing step failed (store write, dedup lookup, publish).
    #[error("processing failed: {0}")]
    TransientProcess(String),

    /// Bounded ingress is saturated. The caller decides whether to retry.
    #[error("{pool} queue is full (capacity {capacity})")]
    QueueFull { pool: &'static str, capacity: usize },

    #[error("{0} pool is not accepting jobs")]
    PoolClosed(&'static str),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("transformer `{stage}` failed: {reason}")]
    Transformer { stage: &'static str, reason: String },

    /// A panic caught at a scheduler tick or worker job boundary.
    #[error("panic recovered in {context}: {message}")]
    PanicRecovered { context: String, message: String },

    #[error("publish to `{route}` failed: {reason}")]
    Publish { route: String, reason: String },

    #[error("shutdown requested")]
    Cancelled,

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::TransientProcess(msg.into())
    }

    /// Ingress rejections are handed back to the caller rather than retried
    /// by the pool itself.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    /// A malformed message fails the same way on every delivery; everything
    /// else may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_is_backpressure_not_terminal() {
        let e = PipelineError::QueueFull {
            pool: "collection",
            capacity: 10,
        };
        assert!(e.is_backpressure());
        assert!(e.is_retryable());
        assert_eq!(e.to_string(), "collection queue is full (capacity 10)");
    }

    #[test]
    fn validation_is_terminal() {
        let e = PipelineError::validation("job source cannot be empty");
        assert!(!e.is_retryable());
        assert!(!e.is_backpressure());
    }
}
