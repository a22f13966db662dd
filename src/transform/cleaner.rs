// src/transform/cleaner.rs
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::Transformer;
use crate::error::Result;
use crate::model::NewsItem;

const SUMMARY_MIN_WORDS: usize = 80;
const SUMMARY_MAX_WORDS: usize = 120;
/// A sentence end is only used as the cut point past roughly this many chars.
const SUMMARY_MIN_CUT: usize = SUMMARY_MIN_WORDS * 5;
const SUMMARY_TAIL: usize = 30;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));
static RE_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(amp|lt|gt|quot|apos|nbsp|hellip|mdash|ndash|rsquo|lsquo|rdquo|ldquo);")
        .expect("entity regex")
});
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Single pass, so `&amp;lt;` becomes `&lt;` and stays that way.
fn decode_entities(s: &str) -> String {
    RE_ENTITY
        .replace_all(s, |c: &Captures| {
            match &c[1] {
                "amp" => "&",
                "lt" => "<",
                "gt" => ">",
                "quot" | "rdquo" | "ldquo" => "\"",
                "apos" | "rsquo" | "lsquo" => "'",
                "nbsp" => " ",
                "hellip" => "...",
                "mdash" => "\u{2014}",
                "ndash" => "\u{2013}",
                _ => "",
            }
            .to_string()
        })
        .into_owned()
}

pub fn clean_text(s: &str) -> String {
    let no_tags = RE_TAGS.replace_all(s, " ");
    let decoded = decode_entities(&no_tags);
    RE_WS.replace_all(&decoded, " ").trim().to_string()
}

pub fn summarize(content: &str) -> String {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.len() < SUMMARY_MIN_WORDS {
        return content.to_string();
    }
    let summary = words[..words.len().min(SUMMARY_MAX_WORDS)].join(" ");
    let cut = summary.rfind(['.', '!', '?']);
    match cut {
        Some(i) if i + SUMMARY_TAIL > summary.len() && i > SUMMARY_MIN_CUT => {
            summary[..=i].to_string()
        }
        _ => format!("{summary}..."),
    }
}

/// Strips markup, normalises whitespace, fills in summary and author.
pub struct ContentCleaner;

impl Transformer for ContentCleaner {
    fn name(&self) -> &'static str {
        "content_cleaner"
    }

    fn transform(&self, item: &NewsItem) -> Result<NewsItem> {
        let mut out = item.clone();
        out.title = clean_text(&item.title);
        out.content = clean_text(&item.content);
        out.summary = clean_text(&item.summary);
        if out.summary.is_empty() && !out.content.is_empty() {
            out.summary = summarize(&out.content);
        }
        out.author = item.author.trim().to_string();
        if out.author.is_empty() {
            out.author = "Unknown".to_string();
        }
        Ok(out)
    }
}
