// src/model.rs
//! Pipeline data model: articles, broker messages and dead letters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Routing keys used on the message broker.
pub mod routes {
    pub const RAW: &str = "news.raw";
    pub const PROCESSED: &str = "news.processed";
    pub const RETRY: &str = "news.retry";
    pub const FAILED: &str = "news.failed";
}

/// A news article as it travels through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Canonical content hash; set once by the deduplicator.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Secondary dedup keys (url, title, body hashes) for future lookups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fingerprints: Vec<String>,
}

impl NewsItem {
    /// Deterministic id derived from source + url (or title when the url is
    /// missing), so re-fetching the same entry yields the same id.
    pub fn derive_id(source: &str, url: &str, title: &str) -> String {
        let key = if url.trim().is_empty() { title } else { url };
        let digest = crate::dedup::hash_hex(&format!("{source}\u{1f}{key}"));
        digest[..32].to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Raw,
    Processed,
    Enriched,
    Indexed,
    Failed,
}

impl MessageType {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageType::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub collection_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub original_url: String,
    #[serde(default)]
    pub processing_stage: String,
}

/// Envelope published on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsMessage {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: NewsItem,
    #[serde(default)]
    pub metadata: Metadata,
    /// For `news.retry` messages this is the earliest time of the next attempt.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub max_retry: u32,
}

impl NewsMessage {
    pub fn raw(source: &str, item: NewsItem, max_retry: u32) -> Self {
        let now = Utc::now();
        Self {
            id: item.id.clone(),
            source: source.to_string(),
            kind: MessageType::Raw,
            metadata: Metadata {
                collection_time: Some(now),
                content_type: "application/json".to_string(),
                checksum: item.hash.clone(),
                original_url: item.url.clone(),
                processing_stage: "collected".to_string(),
            },
            data: item,
            timestamp: now,
            retry: 0,
            max_retry,
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::PipelineError;
        if self.id.trim().is_empty() {
            return Err(PipelineError::validation("message id cannot be empty"));
        }
        if self.source.trim().is_empty() {
            return Err(PipelineError::validation("message source cannot be empty"));
        }
        if self.data.title.trim().is_empty() {
            return Err(PipelineError::validation("news title cannot be empty"));
        }
        if self.kind.is_terminal() {
            return Err(PipelineError::validation(
                "failed messages are terminal and cannot be reprocessed",
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(body: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Outcome of one processing attempt. Only logged and counted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub message_id: String,
    pub success: bool,
    pub duplicate: bool,
    pub error: Option<String>,
    pub duration: std::time::Duration,
}

/// A message whose retry budget is exhausted, retained for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: String,
    pub original_message: NewsMessage,
    pub failure_reason: String,
    pub failure_count: u32,
    pub last_attempt: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
