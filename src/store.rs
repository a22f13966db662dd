// src/store.rs
//! Persistence and search collaborators.
//!
//! Real deployments plug in a database and a search engine; the in-memory
//! implementations here back the binary's standalone mode and the tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::model::NewsItem;

#[async_trait::async_trait]
pub trait NewsStore: Send + Sync {
    /// Persist a processed article.
    async fn create_news(&self, item: &NewsItem) -> Result<()>;
    /// True when any stored article carries `hash` as its content hash or as
    /// one of its fingerprints.
    async fn check_duplicate(&self, hash: &str) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_news(&self, item: &NewsItem) -> Result<()>;
}

#[derive(Default)]
struct StoreInner {
    items: HashMap<String, NewsItem>,
    hashes: HashSet<String>,
}

/// In-memory `NewsStore`.
///
/// `fail_writes` / `fail_lookups` let tests simulate an unavailable database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    fail_writes: AtomicBool,
    fail_lookups: AtomicBool,
    write_attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<NewsItem> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .items
            .get(id)
            .cloned()
    }

    /// Number of `create_news` calls, including failed ones.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NewsStore for MemoryStore {
    async fn create_news(&self, item: &NewsItem) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if !item.hash.is_empty() {
            inner.hashes.insert(item.hash.clone());
        }
        for fp in &item.fingerprints {
            inner.hashes.insert(fp.clone());
        }
        inner.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn check_duplicate(&self, hash: &str) -> Result<bool> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(anyhow!("duplicate lookup unavailable"));
        }
        Ok(self
            .inner
            .lock()
            .expect("store mutex poisoned")
            .hashes
            .contains(hash))
    }
}

/// In-memory `SearchIndex`; records indexed ids.
#[derive(Default)]
pub struct MemoryIndex {
    ids: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn indexed(&self) -> Vec<String> {
        self.ids.lock().expect("index mutex poisoned").clone()
    }
}

#[async_trait::async_trait]
impl SearchIndex for MemoryIndex {
    async fn index_news(&self, item: &NewsItem) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("search index unavailable"));
        }
        self.ids
            .lock()
            .expect("index mutex poisoned")
            .push(item.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fingerprints_answer_duplicate_lookups() {
        let store = MemoryStore::new();
        let item = NewsItem {
            id: "n1".into(),
            title: "t".into(),
            hash: "content-hash".into(),
            fingerprints: vec!["url-hash".into(), "title-hash".into()],
            ..Default::default()
        };
        store.create_news(&item).await.unwrap();
        assert!(store.check_duplicate("content-hash").await.unwrap());
        assert!(store.check_duplicate("title-hash").await.unwrap());
        assert!(!store.check_duplicate("other").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failure_toggles() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.create_news(&NewsItem::default()).await.is_err());
        assert_eq!(store.write_attempts(), 1);
        assert!(store.is_empty());

        store.set_fail_lookups(true);
        assert!(store.check_duplicate("x").await.is_err());
    }
}
