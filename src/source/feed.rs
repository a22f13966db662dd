// src/source/feed.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use super::{impl_source, SourceCore, SourceSpec};
use crate::model::NewsItem;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    author: Option<String>,
    #[serde(rename = "dc:creator", alias = "creator")]
    creator: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<String>,
    enclosure: Option<Enclosure>,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: String,
    #[serde(rename = "@type", default)]
    mime: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let dt = OffsetDateTime::parse(ts.trim(), &Rfc2822).ok()?;
    DateTime::from_timestamp(dt.unix_timestamp(), dt.nanosecond())
}

/// quick-xml only knows the five XML entities; feeds routinely ship HTML ones.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&hellip;", "...")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

fn text(s: Option<String>) -> String {
    s.map(|v| html_escape::decode_html_entities(v.trim()).to_string())
        .unwrap_or_default()
}

/// RSS 2.0 feed poller.
pub struct FeedSource {
    core: SourceCore,
}

impl FeedSource {
    pub fn new(core: SourceCore) -> Self {
        Self { core }
    }

    fn parse(spec: &SourceSpec, body: &str) -> Result<Vec<NewsItem>> {
        let xml = scrub_html_entities_for_xml(body);
        let rss: Rss = from_str(&xml).with_context(|| format!("parsing rss from {}", spec.name))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let title = text(it.title);
            if title.is_empty() {
                continue;
            }
            let url = it.link.map(|l| l.trim().to_string()).unwrap_or_default();
            let image_url = it
                .enclosure
                .filter(|e| {
                    e.mime
                        .as_deref()
                        .map(|m| m.starts_with("image/"))
                        .unwrap_or(true)
                })
                .map(|e| e.url)
                .unwrap_or_default();
            let author = {
                let a = text(it.author);
                if a.is_empty() {
                    text(it.creator)
                } else {
                    a
                }
            };
            out.push(NewsItem {
                id: NewsItem::derive_id(&spec.name, &url, &title),
                content: it.description.clone().unwrap_or_default(),
                summary: String::new(),
                url,
                image_url,
                author,
                source: spec.name.clone(),
                category: it
                    .categories
                    .first()
                    .map(|c| c.trim().to_lowercase())
                    .unwrap_or_default(),
                tags: it
                    .categories
                    .iter()
                    .map(|c| c.trim().to_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect(),
                published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
                title,
                ..Default::default()
            });
        }
        Ok(out)
    }
}

impl_source!(FeedSource);
