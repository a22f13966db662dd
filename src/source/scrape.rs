// src/source/scrape.rs
//! Single-page scraper: one article per fetch, built from OpenGraph/meta tags
//! and the visible text of `<article>` (falling back to `<body>`).

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};

use super::{impl_source, SourceCore, SourceSpec};
use crate::model::NewsItem;

static SEL_META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[content]").expect("meta selector"));
static SEL_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("title selector"));
static SEL_ARTICLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("article").expect("article selector"));
static SEL_BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").expect("body selector"));

const SKIPPED: [&str; 4] = ["script", "style", "noscript", "template"];

/// `(key, content)` for every `<meta>` carrying `property` or `name`.
fn meta_tags(doc: &Html) -> Vec<(String, String)> {
    doc.select(&SEL_META)
        .filter_map(|el| {
            let attrs = el.value();
            let key = attrs.attr("property").or_else(|| attrs.attr("name"))?;
            let content = attrs.attr("content")?;
            Some((key.trim().to_ascii_lowercase(), content.trim().to_string()))
        })
        .collect()
}

fn collect_text(el: ElementRef<'_>, out: &mut Vec<String>) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push(t.to_string()),
            Node::Element(e) if SKIPPED.contains(&e.name()) => {}
            Node::Element(_) => {
                if let Some(inner) = ElementRef::wrap(child) {
                    collect_text(inner, out);
                }
            }
            _ => {}
        }
    }
}

/// Text content of `el` minus scripts and styles, whitespace collapsed.
fn visible_text(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    collect_text(el, &mut parts);
    parts
        .iter()
        .flat_map(|p| p.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// HTML page scraper.
pub struct ScrapeSource {
    core: SourceCore,
}

impl ScrapeSource {
    pub fn new(core: SourceCore) -> Self {
        Self { core }
    }

    fn parse(spec: &SourceSpec, html: &str) -> Result<Vec<NewsItem>> {
        let doc = Html::parse_document(html);
        let metas = meta_tags(&doc);
        let meta = |key: &str| {
            metas
                .iter()
                .find(|(k, v)| k == key && !v.is_empty())
                .map(|(_, v)| v.clone())
        };

        let title = meta("og:title")
            .or_else(|| {
                doc.select(&SEL_TITLE)
                    .next()
                    .map(visible_text)
                    .filter(|t| !t.is_empty())
            })
            .ok_or_else(|| anyhow!("page at {} has no title", spec.url))?;

        let body = doc
            .select(&SEL_ARTICLE)
            .next()
            .or_else(|| doc.select(&SEL_BODY).next())
            .map(visible_text)
            .unwrap_or_default();

        let url = meta("og:url").unwrap_or_else(|| spec.url.to_string());

        Ok(vec![NewsItem {
            id: NewsItem::derive_id(&spec.name, &url, &title),
            summary: meta("og:description")
                .or_else(|| meta("description"))
                .unwrap_or_default(),
            content: body,
            image_url: meta("og:image").unwrap_or_default(),
            author: meta("author").unwrap_or_default(),
            source: spec.name.clone(),
            url,
            title,
            ..Default::default()
        }])
    }
}

impl_source!(ScrapeSource);
