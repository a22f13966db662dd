// src/source/mod.rs
//! External news sources: feed (RSS), JSON API and HTML page scrape.
//!
//! Every variant shares the same plumbing ([`SourceCore`]): validated spec,
//! health/metrics tracker, rate-limit throttle and a body fetcher that either
//! does HTTP or returns an in-memory fixture.

pub mod api;
pub mod feed;
pub mod scrape;
pub mod throttle;
pub mod tracker;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use url::Url;

use crate::config::{parse_duration, SourceConfig};
use crate::error::{PipelineError, Result};
use crate::model::NewsItem;

pub use api::ApiSource;
pub use feed::FeedSource;
pub use scrape::ScrapeSource;
pub use throttle::Throttle;
pub use tracker::{SourceStats, SourceTracker};

pub const MIN_SCHEDULE: Duration = Duration::from_secs(30);
pub const MAX_SCHEDULE: Duration = Duration::from_secs(24 * 3600);
pub const MAX_NAME_LEN: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

static RE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("name regex"));
// RFC 7230 token
static RE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[!#$%&'*+\-.^_`|~0-9A-Za-z]+$").expect("header regex"));

pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("source_fetch_total", "Source fetch attempts.");
        describe_counter!("source_fetch_errors_total", "Failed source fetches.");
        describe_counter!("source_items_total", "Items returned by sources.");
        describe_histogram!("source_fetch_ms", "Source fetch + parse time in milliseconds.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Api,
    Scraper,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Rss => "rss",
            SourceKind::Api => "api",
            SourceKind::Scraper => "scraper",
        }
    }

    pub fn default_schedule(self) -> Duration {
        match self {
            SourceKind::Rss => Duration::from_secs(15 * 60),
            SourceKind::Api => Duration::from_secs(10 * 60),
            SourceKind::Scraper => Duration::from_secs(30 * 60),
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            SourceKind::Rss => Duration::from_secs(30),
            SourceKind::Api => Duration::from_secs(15),
            SourceKind::Scraper => Duration::from_secs(45),
        }
    }

    pub fn default_retry_delay(self) -> Duration {
        match self {
            SourceKind::Rss => Duration::from_secs(5),
            SourceKind::Api => Duration::from_secs(2),
            SourceKind::Scraper => Duration::from_secs(10),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rss" => Ok(SourceKind::Rss),
            "api" => Ok(SourceKind::Api),
            "scraper" => Ok(SourceKind::Scraper),
            other => Err(PipelineError::validation(format!(
                "unsupported source type `{other}`"
            ))),
        }
    }
}

/// A source configuration that passed validation, with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub name: String,
    pub kind: SourceKind,
    pub url: Url,
    pub schedule: Duration,
    /// Requests per second; `0.0` means unthrottled.
    pub rate_limit: f64,
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub user_agent: Option<String>,
    /// Emit `source_*` Prometheus series; the registry sets this.
    pub metrics_enabled: bool,
}

fn invalid(name: &str, msg: impl fmt::Display) -> PipelineError {
    PipelineError::validation(format!("source `{name}`: {msg}"))
}

pub fn validate_schedule(schedule: Duration) -> Result<()> {
    if schedule < MIN_SCHEDULE || schedule > MAX_SCHEDULE {
        return Err(PipelineError::validation(format!(
            "schedule {schedule:?} outside [{MIN_SCHEDULE:?}, {MAX_SCHEDULE:?}]"
        )));
    }
    Ok(())
}

impl SourceSpec {
    pub fn from_config(cfg: &SourceConfig) -> Result<Self> {
        let name = cfg.name.trim();
        if name.is_empty() {
            return Err(PipelineError::validation("source name is required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(invalid(name, format!("name longer than {MAX_NAME_LEN} chars")));
        }
        if !RE_NAME.is_match(name) {
            return Err(invalid(name, "name may only contain letters, digits, `_` and `-`"));
        }

        let kind: SourceKind = cfg.kind.parse().map_err(|e| invalid(name, e))?;

        let url = Url::parse(cfg.url.trim()).map_err(|e| invalid(name, format!("bad url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(name, format!("unsupported url scheme `{}`", url.scheme())));
        }
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(invalid(name, "url has no host"));
        }

        let schedule = match cfg.schedule.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => {
                let d = parse_duration(s).map_err(|e| invalid(name, e))?;
                validate_schedule(d).map_err(|e| invalid(name, e))?;
                d
            }
            _ => kind.default_schedule(),
        };

        if !cfg.rate_limit.is_finite() || cfg.rate_limit < 0.0 {
            return Err(invalid(name, "rate_limit must be >= 0"));
        }

        let timeout = match cfg.timeout.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => {
                let d = parse_duration(s).map_err(|e| invalid(name, e))?;
                if d.is_zero() {
                    return Err(invalid(name, "timeout must be positive"));
                }
                d
            }
            _ => kind.default_timeout(),
        };

        let retry_delay = match cfg.retry_delay.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => parse_duration(s).map_err(|e| invalid(name, e))?,
            _ => kind.default_retry_delay(),
        };

        for key in cfg.headers.keys() {
            if !RE_HEADER.is_match(key) {
                return Err(invalid(name, format!("invalid header name `{key}`")));
            }
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            url,
            schedule,
            rate_limit: cfg.rate_limit,
            headers: cfg.headers.clone(),
            enabled: cfg.enabled,
            timeout,
            max_retries: cfg.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay,
            user_agent: cfg
                .user_agent
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            metrics_enabled: true,
        })
    }

    /// Re-check invariants of an already built spec.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || !RE_NAME.is_match(&self.name) {
            return Err(PipelineError::validation(format!(
                "invalid source name `{}`",
                self.name
            )));
        }
        validate_schedule(self.schedule).map_err(|e| invalid(&self.name, e))?;
        if self.timeout.is_zero() {
            return Err(invalid(&self.name, "timeout must be positive"));
        }
        Ok(())
    }
}

/// Where a source gets its bytes from.
pub enum Body {
    Fixture(String),
    Http(reqwest::Client),
}

/// Shared state embedded in every source variant.
pub struct SourceCore {
    pub spec: SourceSpec,
    pub tracker: SourceTracker,
    throttle: Throttle,
    body: Body,
}

impl SourceCore {
    pub fn new(spec: SourceSpec) -> Result<Self> {
        let client = build_client(&spec)?;
        Ok(Self::with_body(spec, Body::Http(client)))
    }

    pub fn with_body(spec: SourceSpec, body: Body) -> Self {
        ensure_metrics_described();
        Self {
            tracker: SourceTracker::new(spec.enabled),
            throttle: Throttle::per_second(spec.rate_limit),
            spec,
            body,
        }
    }

    async fn load_body(&self) -> anyhow::Result<String> {
        match &self.body {
            Body::Fixture(s) => Ok(s.clone()),
            Body::Http(client) => {
                let resp = client
                    .get(self.spec.url.clone())
                    .send()
                    .await
                    .with_context(|| format!("GET {}", self.spec.url))?;
                let resp = resp.error_for_status().context("source http status")?;
                resp.text().await.context("reading source body")
            }
        }
    }

    /// Throttle, load, parse and record the outcome in the tracker.
    pub async fn fetch_with<F>(&self, parse: F) -> Result<Vec<NewsItem>>
    where
        F: FnOnce(&SourceSpec, &str) -> anyhow::Result<Vec<NewsItem>> + Send,
    {
        let name = self.spec.name.as_str();
        if !self.tracker.is_enabled() {
            return Err(PipelineError::validation(format!("source `{name}` is disabled")));
        }
        self.throttle.wait().await;

        let metered = self.spec.metrics_enabled;
        let t0 = Instant::now();
        if metered {
            counter!("source_fetch_total", "source" => name.to_string()).increment(1);
        }
        let outcome = match tokio::time::timeout(self.spec.timeout, self.load_body()).await {
            Ok(Ok(body)) => parse(&self.spec, &body),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow::anyhow!("request timed out after {:?}", self.spec.timeout)),
        };
        let elapsed = t0.elapsed();
        if metered {
            histogram!("source_fetch_ms").record(elapsed.as_secs_f64() * 1_000.0);
        }

        match outcome {
            Ok(items) => {
                self.tracker.record_success(elapsed, items.len());
                if metered {
                    counter!("source_items_total", "source" => name.to_string())
                        .increment(items.len() as u64);
                }
                tracing::debug!(source = %name, items = items.len(), ?elapsed, "fetch ok");
                Ok(items)
            }
            Err(e) => {
                let reason = format!("{e:#}");
                self.tracker.record_failure(elapsed, &reason);
                if metered {
                    counter!("source_fetch_errors_total", "source" => name.to_string()).increment(1);
                }
                tracing::warn!(error = %reason, source = %name, "source fetch failed");
                Err(PipelineError::TransientFetch {
                    source_name: name.to_string(),
                    reason,
                })
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.tracker.is_healthy(self.spec.schedule)
    }
}

fn build_client(spec: &SourceSpec) -> Result<reqwest::Client> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    let mut headers = HeaderMap::new();
    for (k, v) in &spec.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| invalid(&spec.name, format!("header `{k}`: {e}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| invalid(&spec.name, format!("header `{k}` value: {e}")))?;
        headers.insert(name, value);
    }
    let ua = spec
        .user_agent
        .clone()
        .unwrap_or_else(|| format!("news-pipeline/{}", env!("CARGO_PKG_VERSION")));

    reqwest::Client::builder()
        .timeout(spec.timeout)
        .user_agent(ua)
        .default_headers(headers)
        .build()
        .map_err(|e| PipelineError::Other(anyhow::Error::new(e).context("building http client")))
}

#[async_trait::async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> SourceKind;
    fn spec(&self) -> &SourceSpec;
    fn schedule(&self) -> Duration {
        self.spec().schedule
    }
    fn validate(&self) -> Result<()> {
        self.spec().validate()
    }
    fn is_healthy(&self) -> bool;
    fn stats(&self) -> SourceStats;
    async fn fetch(&self) -> Result<Vec<NewsItem>>;
}

/// Build the variant matching `spec.kind` with an HTTP body fetcher.
pub fn build(spec: SourceSpec) -> Result<Arc<dyn Source>> {
    let core = SourceCore::new(spec)?;
    Ok(from_core(core))
}

/// Build a source that parses `body` instead of doing HTTP.
pub fn build_fixture(spec: SourceSpec, body: &str) -> Arc<dyn Source> {
    from_core(SourceCore::with_body(spec, Body::Fixture(body.to_string())))
}

fn from_core(core: SourceCore) -> Arc<dyn Source> {
    match core.spec.kind {
        SourceKind::Rss => Arc::new(FeedSource::new(core)),
        SourceKind::Api => Arc::new(ApiSource::new(core)),
        SourceKind::Scraper => Arc::new(ScrapeSource::new(core)),
    }
}

/// Implements the boilerplate half of [`Source`] for a variant wrapping a
/// `core: SourceCore` field and exposing `fn parse(&SourceSpec, &str)`.
macro_rules! impl_source {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl $crate::source::Source for $ty {
            fn name(&self) -> &str {
                &self.core.spec.name
            }
            fn kind(&self) -> $crate::source::SourceKind {
                self.core.spec.kind
            }
            fn spec(&self) -> &$crate::source::SourceSpec {
                &self.core.spec
            }
            fn is_healthy(&self) -> bool {
                self.core.is_healthy()
            }
            fn stats(&self) -> $crate::source::SourceStats {
                self.core.tracker.snapshot()
            }
            async fn fetch(&self) -> $crate::error::Result<Vec<$crate::model::NewsItem>> {
                self.core.fetch_with(Self::parse).await
            }
        }
    };
}
pub(crate) use impl_source;
