// src/dedup.rs
//! Multi-tier duplicate detection.
//!
//! Tiers run in order and stop at the first hit:
//! 1. the item's own content hash (when already set)
//! 2. hash of the raw URL
//! 3. hash of the normalised title
//! 4. hash of the normalised content
//!
//! Every tier is a single `NewsStore::check_duplicate` lookup. A new item gets
//! its canonical hash plus the tier 2..4 keys as fingerprints so later items
//! can match against it.
//!
//! The store only knows about items already written, so [`Deduplicator::admit`]
//! also claims the item's keys until the caller has stored it. A twin arriving
//! on another worker in the meantime is reported as a duplicate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use strsim::normalized_levenshtein;

use crate::error::{PipelineError, Result};
use crate::model::NewsItem;
use crate::store::NewsStore;

const TITLE_PREFIXES: &[&str] = &[
    "breaking:",
    "urgent:",
    "update:",
    "exclusive:",
    "news:",
    "report:",
    "analysis:",
    "opinion:",
    "editorial:",
];

const TITLE_SUFFIXES: &[&str] = &[
    "- cnn",
    "- bbc",
    "- reuters",
    "- ap",
    "- bloomberg",
    "| reuters",
    "| cnn",
    "| bbc",
    "| bloomberg",
];

const CONTENT_KEY_CHARS: usize = 1000;

static RE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+|www\.\S+").expect("url regex"));
static RE_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("email regex")
});

/// SHA-256, lowercase hex.
pub fn hash_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_title(title: &str) -> String {
    let mut t = title.trim().to_lowercase();
    if let Some(p) = TITLE_PREFIXES.iter().find(|p| t.starts_with(**p)) {
        t = t[p.len()..].trim().to_string();
    }
    if let Some(s) = TITLE_SUFFIXES.iter().find(|s| t.ends_with(**s)) {
        t = t[..t.len() - s.len()].trim().to_string();
    }
    collapse_ws(&t)
}

pub fn normalize_content(content: &str) -> String {
    let lower = content.to_lowercase();
    let no_urls = RE_URL.replace_all(&lower, " ");
    let no_mail = RE_EMAIL.replace_all(&no_urls, " ");
    collapse_ws(&no_mail).chars().take(CONTENT_KEY_CHARS).collect()
}

/// Canonical content hash: lowercased, trimmed title + content + url with
/// whitespace collapsed.
pub fn content_hash(item: &NewsItem) -> String {
    let joined = format!(
        "{}{}{}",
        item.title.trim().to_lowercase(),
        item.content.trim().to_lowercase(),
        item.url.trim().to_lowercase()
    );
    hash_hex(&collapse_ws(&joined))
}

/// Tier 2..4 keys, skipping empty inputs.
pub fn fingerprints(item: &NewsItem) -> Vec<String> {
    let mut out = Vec::with_capacity(3);
    if !item.url.trim().is_empty() {
        out.push(hash_hex(item.url.trim()));
    }
    let title = normalize_title(&item.title);
    if !title.is_empty() {
        out.push(hash_hex(&title));
    }
    let body = normalize_content(&item.content);
    if !body.is_empty() {
        out.push(hash_hex(&body));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateTier {
    ContentHash,
    Url,
    Title,
    Content,
}

impl DuplicateTier {
    pub fn as_str(self) -> &'static str {
        match self {
            DuplicateTier::ContentHash => "content_hash",
            DuplicateTier::Url => "url",
            DuplicateTier::Title => "title",
            DuplicateTier::Content => "content",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Duplicate(DuplicateTier),
    Unique,
}

/// Keys of items between their dedup check and their store write.
#[derive(Debug, Default)]
struct InFlight {
    keys: Mutex<HashSet<String>>,
}

impl InFlight {
    /// Claims every key, or returns the first one already held.
    fn claim(self: &Arc<Self>, keys: Vec<String>) -> std::result::Result<Claim, String> {
        let mut held = self.keys.lock().expect("in-flight set poisoned");
        if let Some(taken) = keys.iter().find(|k| held.contains(*k)) {
            return Err(taken.clone());
        }
        held.extend(keys.iter().cloned());
        Ok(Claim {
            owner: self.clone(),
            keys,
        })
    }
}

/// Releases its keys when dropped, whether or not the item got stored.
#[derive(Debug)]
pub struct Claim {
    owner: Arc<InFlight>,
    keys: Vec<String>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut held = self.owner.keys.lock().expect("in-flight set poisoned");
        for k in &self.keys {
            held.remove(k);
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Duplicate(DuplicateTier),
    /// Hold the claim until the item is stored.
    Unique(Claim),
}

pub struct Deduplicator {
    store: Arc<dyn NewsStore>,
    inflight: Arc<InFlight>,
}

fn candidates(item: &NewsItem) -> Vec<(DuplicateTier, String)> {
    let mut out = Vec::with_capacity(4);
    if !item.hash.is_empty() {
        out.push((DuplicateTier::ContentHash, item.hash.clone()));
    }
    if !item.url.trim().is_empty() {
        out.push((DuplicateTier::Url, hash_hex(item.url.trim())));
    }
    let title = normalize_title(&item.title);
    if !title.is_empty() {
        out.push((DuplicateTier::Title, hash_hex(&title)));
    }
    let body = normalize_content(&item.content);
    if !body.is_empty() {
        out.push((DuplicateTier::Content, hash_hex(&body)));
    }
    out
}

impl Deduplicator {
    pub fn new(store: Arc<dyn NewsStore>) -> Self {
        Self {
            store,
            inflight: Arc::new(InFlight::default()),
        }
    }

    async fn seen(&self, tier: DuplicateTier, key: &str) -> Result<bool> {
        self.store.check_duplicate(key).await.map_err(|e| {
            PipelineError::process(format!("duplicate lookup ({}) failed: {e:#}", tier.as_str()))
        })
    }

    /// Runs the tiers; on `Unique` the item carries its hash and fingerprints.
    pub async fn check(&self, item: &mut NewsItem) -> Result<Verdict> {
        Ok(match self.admit(item).await? {
            Admission::Duplicate(tier) => Verdict::Duplicate(tier),
            Admission::Unique(_) => Verdict::Unique,
        })
    }

    /// Like [`check`](Self::check), but a unique item's keys stay claimed
    /// until the returned [`Claim`] is dropped.
    pub async fn admit(&self, item: &mut NewsItem) -> Result<Admission> {
        let candidates = candidates(item);
        let canonical = if item.hash.is_empty() {
            content_hash(item)
        } else {
            item.hash.clone()
        };
        let mut keys: Vec<String> = candidates.iter().map(|(_, k)| k.clone()).collect();
        if !keys.contains(&canonical) {
            keys.push(canonical.clone());
        }

        let claim = match self.inflight.claim(keys) {
            Ok(claim) => claim,
            Err(taken) => {
                let tier = candidates
                    .iter()
                    .find(|(_, k)| *k == taken)
                    .map(|(t, _)| *t)
                    .unwrap_or(DuplicateTier::ContentHash);
                tracing::info!(target: "dedup", id = %item.id, tier = tier.as_str(), "duplicate already in flight");
                return Ok(Admission::Duplicate(tier));
            }
        };

        for (tier, key) in &candidates {
            if self.seen(*tier, key).await? {
                tracing::info!(target: "dedup", id = %item.id, tier = tier.as_str(), "duplicate found");
                return Ok(Admission::Duplicate(*tier));
            }
        }

        item.hash = canonical;
        item.fingerprints = candidates
            .into_iter()
            .filter(|(t, _)| *t != DuplicateTier::ContentHash)
            .map(|(_, k)| k)
            .collect();
        tracing::debug!(target: "dedup", id = %item.id, hash = %item.hash, "no duplicate");
        Ok(Admission::Unique(claim))
    }
}

// --- near-duplicate helpers (not on the default path) ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityThresholds {
    pub title: f64,
    pub content: f64,
}

impl Default for SimilarityThresholds {
    fn default() -> Self {
        Self {
            title: 0.85,
            content: 0.80,
        }
    }
}

/// Jaccard similarity over lowercase word sets.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let wa: HashSet<String> = a.split_whitespace().map(|w| w.to_lowercase()).collect();
    let wb: HashSet<String> = b.split_whitespace().map(|w| w.to_lowercase()).collect();
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let inter = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    inter / union
}

/// Normalised Levenshtein similarity in 0..=1.
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
}

pub fn is_near_duplicate(a: &NewsItem, b: &NewsItem, th: SimilarityThresholds) -> bool {
    let ta = normalize_title(&a.title);
    let tb = normalize_title(&b.title);
    if !ta.is_empty() && levenshtein_similarity(&ta, &tb) >= th.title {
        return true;
    }
    let ca = normalize_content(&a.content);
    let cb = normalize_content(&b.content);
    !ca.is_empty() && jaccard(&ca, &cb) >= th.content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn item(id: &str, title: &str, content: &str, url: &str) -> NewsItem {
        NewsItem {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            hash_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn title_normalisation_strips_one_prefix_and_suffix() {
        assert_eq!(
            normalize_title("BREAKING:  Fed   holds rates - Reuters"),
            "fed holds rates"
        );
        assert_eq!(normalize_title("Update: update: x"), "update: x");
    }

    #[test]
    fn content_normalisation_drops_links_and_mail() {
        let n = normalize_content("See https://x.io/a and write to desk@news.com NOW");
        assert_eq!(n, "see and write to now");
        let long = "word ".repeat(500);
        assert_eq!(normalize_content(&long).chars().count(), CONTENT_KEY_CHARS);
    }

    #[tokio::test]
    async fn unique_item_gets_hash_and_fingerprints() {
        let store = Arc::new(MemoryStore::new());
        let dd = Deduplicator::new(store);
        let mut it = item("1", "Fed holds", "Rates unchanged.", "https://a/1");
        assert_eq!(dd.check(&mut it).await.unwrap(), Verdict::Unique);
        assert_eq!(it.hash, content_hash(&it));
        assert_eq!(it.fingerprints.len(), 3);
    }

    #[tokio::test]
    async fn retitled_wire_copy_matches_on_title_tier() {
        let store = Arc::new(MemoryStore::new());
        let dd = Deduplicator::new(store.clone());
        let mut first = item("1", "Fed holds rates", "Body one", "https://a/1");
        dd.check(&mut first).await.unwrap();
        store.create_news(&first).await.unwrap();

        let mut second = item("2", "Breaking: Fed holds rates | Reuters", "Other", "https://b/2");
        assert_eq!(
            dd.check(&mut second).await.unwrap(),
            Verdict::Duplicate(DuplicateTier::Title)
        );
    }

    #[tokio::test]
    async fn lookup_failure_is_hard_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_lookups(true);
        let dd = Deduplicator::new(store);
        let mut it = item("1", "t", "c", "https://a/1");
        assert!(matches!(
            dd.check(&mut it).await,
            Err(PipelineError::TransientProcess(_))
        ));
        assert!(it.hash.is_empty());
    }

    #[test]
    fn near_duplicate_helpers() {
        let th = SimilarityThresholds::default();
        let a = item("1", "Fed holds rates steady", "", "");
        let b = item("2", "Fed holds rates steady.", "", "");
        assert!(is_near_duplicate(&a, &b, th));
        assert!((jaccard("a b c", "a b d") - 0.5).abs() < 1e-9);
        let c = item("3", "Oil prices jump", "", "");
        assert!(!is_near_duplicate(&a, &c, th));
    }

    #[tokio::test]
    async fn twin_is_a_duplicate_while_first_is_unstored() {
        let store = Arc::new(MemoryStore::new());
        let dd = Deduplicator::new(store);
        let mut first = item("1", "Fed holds rates", "Body", "https://a/1");
        let claim = match dd.admit(&mut first).await.unwrap() {
            Admission::Unique(c) => c,
            other => panic!("expected unique, got {other:?}"),
        };

        let mut twin = item("2", "Fed holds rates", "Body", "https://a/1");
        assert!(matches!(
            dd.admit(&mut twin).await.unwrap(),
            Admission::Duplicate(DuplicateTier::Url)
        ));

        // never stored, so the keys free up again
        drop(claim);
        let mut again = item("3", "Fed holds rates", "Body", "https://a/1");
        assert_eq!(dd.check(&mut again).await.unwrap(), Verdict::Unique);
    }
}
