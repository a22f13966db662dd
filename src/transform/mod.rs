// src/transform/mod.rs
//! Ordered enrichment stages applied to every non-duplicate article.
//!
//! A failing (or panicking) stage is logged and skipped; the next stage sees
//! the value from before the failed one.

pub mod classifier;
pub mod cleaner;
pub mod image;
pub mod sentiment;

use std::panic::{catch_unwind, AssertUnwindSafe};

use metrics::counter;

use crate::boundary::panic_message;
use crate::error::{PipelineError, Result};
use crate::model::NewsItem;

pub use classifier::CategoryClassifier;
pub use cleaner::ContentCleaner;
pub use image::ImageExtractor;
pub use sentiment::SentimentTagger;

pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;
    fn transform(&self, item: &NewsItem) -> Result<NewsItem>;
}

pub struct TransformerChain {
    stages: Vec<Box<dyn Transformer>>,
}

impl Default for TransformerChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ContentCleaner),
            Box::new(CategoryClassifier),
            Box::new(SentimentTagger::new()),
            Box::new(ImageExtractor),
        ])
    }
}

impl TransformerChain {
    pub fn new(stages: Vec<Box<dyn Transformer>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn apply(&self, item: NewsItem) -> NewsItem {
        let mut current = item;
        for stage in &self.stages {
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.transform(&current)))
                .unwrap_or_else(|payload| {
                    Err(PipelineError::Transformer {
                        stage: stage.name(),
                        reason: format!("panicked: {}", panic_message(payload.as_ref())),
                    })
                });
            match outcome {
                Ok(next) => current = next,
                Err(e) => {
                    counter!("transformer_failures_total", "stage" => stage.name()).increment(1);
                    tracing::warn!(target: "transform", stage = stage.name(), id = %current.id, error = %e, "transformer failed, skipping");
                }
            }
        }
        current
    }
}
