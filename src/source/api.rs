// src/source/api.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{impl_source, SourceCore, SourceSpec};
use crate::model::NewsItem;

#[derive(Debug, Deserialize)]
struct ApiArticle {
    title: Option<String>,
    #[serde(alias = "summary")]
    description: Option<String>,
    content: Option<String>,
    #[serde(alias = "link")]
    url: Option<String>,
    #[serde(rename = "urlToImage", alias = "image_url", alias = "image")]
    image: Option<String>,
    author: Option<String>,
    #[serde(rename = "publishedAt", alias = "published_at")]
    published_at: Option<String>,
    category: Option<String>,
}

/// A bare array, or an object wrapping the array (NewsAPI and friends).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    List(Vec<ApiArticle>),
    Wrapped {
        #[serde(alias = "items", alias = "data")]
        articles: Vec<ApiArticle>,
    },
}

fn clean(s: Option<String>) -> String {
    s.map(|v| v.trim().to_string()).unwrap_or_default()
}

/// JSON API poller.
pub struct ApiSource {
    core: SourceCore,
}

impl ApiSource {
    pub fn new(core: SourceCore) -> Self {
        Self { core }
    }

    fn parse(spec: &SourceSpec, body: &str) -> Result<Vec<NewsItem>> {
        let payload: Payload = serde_json::from_str(body)
            .with_context(|| format!("parsing api payload from {}", spec.name))?;
        let articles = match payload {
            Payload::List(v) => v,
            Payload::Wrapped { articles } => articles,
        };

        Ok(articles
            .into_iter()
            .filter_map(|a| {
                let title = clean(a.title);
                if title.is_empty() {
                    return None;
                }
                let url = clean(a.url);
                let summary = clean(a.description);
                let content = match clean(a.content) {
                    c if c.is_empty() => summary.clone(),
                    c => c,
                };
                Some(NewsItem {
                    id: NewsItem::derive_id(&spec.name, &url, &title),
                    title,
                    content,
                    summary,
                    url,
                    image_url: clean(a.image),
                    author: clean(a.author),
                    source: spec.name.clone(),
                    category: clean(a.category).to_lowercase(),
                    published_at: a
                        .published_at
                        .as_deref()
                        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
                        .map(|d| d.with_timezone(&Utc)),
                    ..Default::default()
                })
            })
            .collect())
    }
}

impl_source!(ApiSource);
