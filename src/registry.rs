// src/registry.rs
//! Owns the configured sources. Mutations take the write lock; status and
//! lookups only read.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;

use crate::config::SourceConfig;
use crate::error::PipelineError;
use crate::source::{self, Source, SourceKind, SourceSpec, SourceStats};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("source `{0}` already exists")]
    Duplicate(String),
    #[error("source `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Invalid(#[from] PipelineError),
    #[error("{} of {total} sources failed to initialize: {}", .failures.len(), summarize(.failures))]
    Partial {
        total: usize,
        failures: Vec<(String, String)>,
    },
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(n, e)| format!("{n}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Builds a live source from a validated spec. Swapped out in tests to serve
/// fixtures instead of HTTP.
pub type SourceFactory =
    Arc<dyn Fn(SourceSpec) -> crate::error::Result<Arc<dyn Source>> + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub kind: SourceKind,
    pub url: String,
    pub schedule: Duration,
    pub healthy: bool,
    pub stats: SourceStats,
}

pub struct SourceRegistry {
    sources: RwLock<BTreeMap<String, Arc<dyn Source>>>,
    factory: SourceFactory,
    metrics_enabled: bool,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(source::build))
    }

    pub fn with_factory(factory: SourceFactory) -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            factory,
            metrics_enabled: true,
        }
    }

    /// Whether sources added from now on emit Prometheus series.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Registers every enabled config, continuing past bad ones.
    pub fn initialize(&self, configs: &[SourceConfig]) -> Result<(), RegistryError> {
        tracing::info!(count = configs.len(), "initializing sources");
        let mut failures = Vec::new();
        let mut registered = 0usize;
        for cfg in configs {
            if !cfg.enabled {
                tracing::info!(source = %cfg.name, "source disabled, skipping");
                continue;
            }
            match self.add_source(cfg) {
                Ok(()) => registered += 1,
                Err(e) => {
                    tracing::error!(error = %e, source = %cfg.name, "failed to initialize source");
                    let name = if cfg.name.trim().is_empty() {
                        "<unnamed>".to_string()
                    } else {
                        cfg.name.clone()
                    };
                    failures.push((name, e.to_string()));
                }
            }
        }
        tracing::info!(registered, failed = failures.len(), "sources initialized");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Partial {
                total: configs.len(),
                failures,
            })
        }
    }

    pub fn add_source(&self, cfg: &SourceConfig) -> Result<(), RegistryError> {
        let mut spec = SourceSpec::from_config(cfg)?;
        spec.metrics_enabled = self.metrics_enabled;
        // cheap pre-check so a duplicate never builds an http client
        if self.contains(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        let name = spec.name.clone();
        let src = (self.factory)(spec)?;
        src.validate()?;

        let mut map = self.sources.write().expect("registry lock poisoned");
        if map.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::info!(source = %name, kind = %src.kind(), schedule = ?src.schedule(), "source added");
        map.insert(name, src);
        Ok(())
    }

    pub fn remove_source(&self, name: &str) -> Result<Arc<dyn Source>, RegistryError> {
        let removed = self
            .sources
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        tracing::info!(source = %name, "source removed");
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    pub fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.sources
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> BTreeMap<String, SourceStatus> {
        // snapshot first; health checks run without holding the lock
        self.sources()
            .into_iter()
            .map(|s| {
                (
                    s.name().to_string(),
                    SourceStatus {
                        kind: s.kind(),
                        url: s.spec().url.to_string(),
                        schedule: s.schedule(),
                        healthy: s.is_healthy(),
                        stats: s.stats(),
                    },
                )
            })
            .collect()
    }

    pub fn validate_all(&self) -> BTreeMap<String, String> {
        self.sources()
            .into_iter()
            .filter_map(|s| {
                s.validate()
                    .err()
                    .map(|e| (s.name().to_string(), e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_feed(spec: SourceSpec) -> crate::error::Result<Arc<dyn Source>> {
        Ok(source::build_fixture(spec, "<rss><channel></channel></rss>"))
    }

    fn fixture_registry() -> SourceRegistry {
        SourceRegistry::with_factory(Arc::new(empty_feed))
    }

    #[test]
    fn initialize_keeps_good_sources_and_reports_bad_ones() {
        let reg = fixture_registry();
        let mut disabled = SourceConfig::new("off", "rss", "https://a.example/rss");
        disabled.enabled = false;
        let configs = vec![
            SourceConfig::new("good", "rss", "https://a.example/rss"),
            SourceConfig::new("bad type", "fax", "https://a.example/rss"),
            disabled,
            SourceConfig::new("good", "api", "https://b.example/api"),
        ];
        match reg.initialize(&configs) {
            Err(RegistryError::Partial { total, failures }) => {
                assert_eq!(total, 4);
                assert_eq!(failures.len(), 2);
                assert!(failures[1].1.contains("already exists"));
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
        assert_eq!(reg.names(), vec!["good".to_string()]);
        assert_eq!(reg.get("good").unwrap().kind(), SourceKind::Rss);
    }

    #[test]
    fn remove_unknown_has_no_side_effects() {
        let reg = fixture_registry();
        reg.add_source(&SourceConfig::new("a", "rss", "https://a.example/rss"))
            .unwrap();
        assert!(matches!(reg.remove_source("zzz"), Err(RegistryError::NotFound(_))));
        assert_eq!(reg.len(), 1);
        reg.remove_source("a").unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn status_reports_every_source() {
        let reg = fixture_registry();
        reg.add_source(&SourceConfig::new("a", "rss", "https://a.example/rss").with_schedule("1m"))
            .unwrap();
        let st = reg.status();
        let a = &st["a"];
        assert_eq!(a.schedule, Duration::from_secs(60));
        assert!(a.healthy);
        assert_eq!(a.stats.total_fetches, 0);
        assert!(reg.validate_all().is_empty());
    }

    #[test]
    fn metrics_flag_reaches_every_added_source() {
        let reg = fixture_registry().with_metrics(false);
        reg.add_source(&SourceConfig::new("quiet", "rss", "https://a.example/rss")).unwrap();
        assert!(!reg.get("quiet").unwrap().spec().metrics_enabled);

        let reg = fixture_registry();
        reg.add_source(&SourceConfig::new("loud", "rss", "https://a.example/rss")).unwrap();
        assert!(reg.get("loud").unwrap().spec().metrics_enabled);
    }
}
