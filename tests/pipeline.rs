// tests/pipeline.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use news_pipeline::broker::{InMemoryBroker, MessageQueue};
use news_pipeline::config::{AppConfig, ProcessorConfig, SourceConfig};
use news_pipeline::model::{routes, MessageType};
use news_pipeline::processing::{Outcome, Pipeline};
use news_pipeline::registry::SourceRegistry;
use news_pipeline::source::{self, Source, SourceKind, SourceSpec, SourceStats};
use news_pipeline::store::{MemoryIndex, MemoryStore, NewsStore};
use news_pipeline::transform::TransformerChain;
use news_pipeline::{Collector, NewsItem, NewsMessage, Processor, Shutdown};
use tokio::sync::{Notify, Semaphore};

fn article(id: &str, title: &str, content: &str, url: &str) -> NewsItem {
    NewsItem {
        id: id.into(),
        title: title.into(),
        content: content.into(),
        url: url.into(),
        source: "wire".into(),
        ..Default::default()
    }
}

#[test]
fn transformer_chain_is_deterministic() {
    let chain = TransformerChain::default();
    let item = article(
        "d1",
        "<h1>Breaking: Hospital trial shows vaccine breakthrough</h1>",
        "<p>Doctors celebrate&nbsp;progress. See https://cdn.example.com/trial.jpg for the chart.</p>",
        "https://example.com/d1",
    );
    let runs: Vec<NewsItem> = (0..5).map(|_| chain.apply(item.clone())).collect();
    assert!(runs.windows(2).all(|w| w[0] == w[1]));
    let out = &runs[0];
    assert_eq!(out.category, "health");
    assert_eq!(out.image_url, "https://cdn.example.com/trial.jpg");
    assert_eq!(out.tags, vec!["positive", "urgent"]);
    assert!(!out.title.contains('<'));
}

#[tokio::test]
async fn normalised_duplicate_never_reaches_the_store() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = Pipeline::new(store.clone(), Arc::new(MemoryIndex::new()), broker);

    let first = NewsMessage::raw(
        "wire",
        article("a", "Central bank holds rates", "Rates stay at 4%.", "https://a.example/1"),
        3,
    );
    // different id, url and markup; same title once normalised
    let second = NewsMessage::raw(
        "other",
        article("b", "BREAKING:  Central bank holds rates ", "Different body.", "https://b.example/9"),
        3,
    );

    assert!(matches!(pipeline.run(&first).await.unwrap(), Outcome::Stored(_)));
    assert!(matches!(pipeline.run(&second).await.unwrap(), Outcome::Duplicate(_)));
    assert_eq!(store.write_attempts(), 1);
    assert!(store.get("b").is_none());
}

/// Parks every write until a permit is released.
struct SlowStore {
    inner: MemoryStore,
    writing: Notify,
    gate: Semaphore,
}

#[async_trait::async_trait]
impl NewsStore for SlowStore {
    async fn create_news(&self, item: &NewsItem) -> anyhow::Result<()> {
        self.writing.notify_one();
        let _permit = self.gate.acquire().await?;
        self.inner.create_news(item).await
    }

    async fn check_duplicate(&self, hash: &str) -> anyhow::Result<bool> {
        self.inner.check_duplicate(hash).await
    }
}

#[tokio::test]
async fn concurrent_twins_store_once() {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        writing: Notify::new(),
        gate: Semaphore::new(0),
    });
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        Arc::new(MemoryIndex::new()),
        Arc::new(InMemoryBroker::new()),
    ));
    let copy = |id: &str, source: &str| {
        NewsMessage::raw(
            source,
            article(id, "Port strike ends", "Dockers return to work.", "https://wire.example/7"),
            3,
        )
    };

    let first = tokio::spawn({
        let p = pipeline.clone();
        let m = copy("w1", "wire");
        async move { p.run(&m).await }
    });
    // first copy is past dedup and parked on its write
    store.writing.notified().await;

    let second = pipeline.run(&copy("w2", "mirror")).await.unwrap();
    assert!(matches!(second, Outcome::Duplicate(_)));

    store.gate.add_permits(1);
    assert!(matches!(first.await.unwrap().unwrap(), Outcome::Stored(_)));
    assert_eq!(store.inner.len(), 1);
}

#[tokio::test]
async fn three_failures_end_in_failed_queue() {
    let broker = Arc::new(InMemoryBroker::with_requeue_delay(Duration::from_millis(5)));
    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);
    let cfg = ProcessorConfig {
        worker_count: 2,
        max_retry: 3,
        retry_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let processor = Processor::new(&cfg, store.clone(), Arc::new(MemoryIndex::new()), broker.clone(), Shutdown::new());
    processor.start().await.unwrap();

    let msg = NewsMessage::raw("wire", article("f1", "Doomed", "", "https://example.com/f1"), 3);
    broker.publish(routes::RAW, &msg).await.unwrap();
    assert!(broker.wait_for_published(routes::FAILED, 1, Duration::from_secs(5)).await);
    processor.stop().await;

    assert_eq!(store.write_attempts(), 3);
    let retries: Vec<u32> = broker.published(routes::RETRY).iter().map(|m| m.retry).collect();
    assert_eq!(retries, vec![1, 2]);
    let failed = broker.published(routes::FAILED);
    assert_eq!(failed[0].kind, MessageType::Failed);
    assert_eq!(failed[0].retry, 3);

    let dead = processor.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_count, 3);
    assert_eq!(dead[0].original_message.id, "f1");
    assert!(dead[0].failure_reason.contains("store unavailable"));
}

/// Wraps a fixture source and makes each fetch take a while.
struct Slow {
    inner: Arc<dyn Source>,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Source for Slow {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }
    fn spec(&self) -> &SourceSpec {
        self.inner.spec()
    }
    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }
    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }
    async fn fetch(&self) -> news_pipeline::Result<Vec<NewsItem>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let items = self.inner.fetch().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        items
    }
}

#[tokio::test(start_paused = true)]
async fn removing_a_source_mid_fetch_lets_it_finish_then_stops_ticking() {
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (s, f) = (started.clone(), finished.clone());
    let registry = SourceRegistry::with_factory(Arc::new(
        move |spec: SourceSpec| -> news_pipeline::Result<Arc<dyn Source>> {
            let inner = source::build_fixture(
                spec,
                "<rss><channel><item><title>Only story</title><link>https://example.com/o</link></item></channel></rss>",
            );
            Ok(Arc::new(Slow {
                inner,
                started: s.clone(),
                finished: f.clone(),
            }))
        },
    ));

    let broker = Arc::new(InMemoryBroker::new());
    let cfg = AppConfig {
        sources: vec![SourceConfig::new("slow", "rss", "https://example.com/rss").with_schedule("30s")],
        ..Default::default()
    };
    let collector = Collector::new(&cfg, registry, broker.clone(), Shutdown::new());
    collector.start();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    collector.remove_source("slow").unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1, "no tick after removal");
    assert_eq!(finished.load(Ordering::SeqCst), 1, "in-flight fetch completed");
    assert_eq!(broker.published(routes::RAW).len(), 1);
    assert_eq!(collector.metrics().active_sources, 0);
    collector.stop().await;
}
