// src/config/mod.rs
//! Pipeline configuration: TOML file + `.env` + a handful of env overrides.
//!
//! Lookup order:
//! 1) `$PIPELINE_CONFIG_PATH`
//! 2) `config/pipeline.toml`
//! 3) built-in defaults

pub mod duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use duration::parse_duration;

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// One configured source, as written in the config file.
///
/// Fields stay loosely typed here (strings for type/schedule/timeouts) so a
/// single bad entry is rejected by the registry instead of failing the whole
/// file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub rate_limit: f64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl SourceConfig {
    pub fn new(name: &str, kind: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            url: url.to_string(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.schedule = Some(schedule.to_string());
        self
    }
}

/// Collection-side worker pool settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    #[serde(deserialize_with = "duration::deserialize")]
    pub job_timeout: Duration,
    pub retry_attempts: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub retry_delay: Duration,
    pub metrics_enabled: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_size: 1000,
            job_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            metrics_enabled: true,
        }
    }
}

/// Processing-side worker pool and retry policy settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    #[serde(deserialize_with = "duration::deserialize")]
    pub job_timeout: Duration,
    /// Total processing attempts before a message is dead-lettered.
    pub max_retry: u32,
    /// Delay unit for retries: attempt `n` waits `n * retry_delay`.
    #[serde(deserialize_with = "duration::deserialize")]
    pub retry_delay: Duration,
    pub dead_letter_capacity: usize,
    pub metrics_enabled: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            queue_size: 1000,
            job_timeout: Duration::from_secs(60),
            max_retry: 3,
            retry_delay: Duration::from_secs(60),
            dead_letter_capacity: 1000,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub collector: CollectorConfig,
    pub processor: ProcessorConfig,
    pub metrics: MetricsConfig,
    pub sources: Vec<SourceConfig>,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(s).context("parsing pipeline config")?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Pool-level sanity checks. Per-source checks belong to the registry.
    fn check(&self) -> Result<()> {
        if self.collector.worker_count == 0 || self.processor.worker_count == 0 {
            return Err(anyhow!("worker_count must be at least 1"));
        }
        if self.collector.queue_size == 0 || self.processor.queue_size == 0 {
            return Err(anyhow!("queue_size must be at least 1"));
        }
        if self.processor.max_retry == 0 {
            return Err(anyhow!("processor.max_retry must be at least 1"));
        }
        Ok(())
    }

    /// Apply `COLLECTOR_*`, `PROCESSOR_*` and `METRICS_PORT` overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        fn read<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
            match std::env::var(key) {
                Ok(v) => v
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| anyhow!("{key} has an invalid value: {v}")),
                Err(_) => Ok(None),
            }
        }

        if let Some(v) = read("COLLECTOR_WORKER_COUNT")? {
            self.collector.worker_count = v;
        }
        if let Some(v) = read("COLLECTOR_QUEUE_SIZE")? {
            self.collector.queue_size = v;
        }
        if let Some(v) = read("PROCESSOR_WORKER_COUNT")? {
            self.processor.worker_count = v;
        }
        if let Some(v) = read("PROCESSOR_QUEUE_SIZE")? {
            self.processor.queue_size = v;
        }
        if let Some(v) = read("METRICS_PORT")? {
            self.metrics.port = v;
        }
        self.check()
    }
}

/// Load config from an explicit path.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config from {}", path.display()))?;
    AppConfig::from_toml_str(&content)
}

/// Load config using env var + fallbacks, then apply env overrides.
pub fn load_default() -> Result<AppConfig> {
    let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        load_from(&pb)?
    } else {
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            load_from(&default_p)?
        } else {
            AppConfig::default()
        }
    };
    cfg.apply_env_overrides()?;
    Ok(cfg)
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    const SAMPLE: &str = r#"
        [collector]
        worker_count = 4
        queue_size = 50
        job_timeout = "10s"
        retry_delay = "500ms"

        [processor]
        max_retry = 5
        retry_delay = "2m"

        [[sources]]
        name = "fed-press"
        type = "rss"
        url = "https://www.federalreserve.gov/feeds/press_all.xml"
        schedule = "15m"
        rate_limit = 2.0
        headers = { Accept = "application/rss+xml" }

        [[sources]]
        name = "broken"
        type = "carrier-pigeon"
        url = "nowhere"
        enabled = false
    "#;

    #[test]
    fn parses_sample_and_keeps_bad_sources_for_registry() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.collector.worker_count, 4);
        assert_eq!(cfg.collector.job_timeout, Duration::from_secs(10));
        assert_eq!(cfg.collector.retry_delay, Duration::from_millis(500));
        // untouched fields keep defaults
        assert_eq!(cfg.collector.retry_attempts, 3);
        assert_eq!(cfg.processor.max_retry, 5);
        assert_eq!(cfg.processor.retry_delay, Duration::from_secs(120));
        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[0].headers["Accept"], "application/rss+xml");
        assert!(!cfg.sources[1].enabled);
    }

    #[test]
    fn zero_workers_rejected() {
        let err = AppConfig::from_toml_str("[collector]\nworker_count = 0\n").unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var("COLLECTOR_WORKER_COUNT");

        // nothing on disk -> defaults
        let cfg = load_default().unwrap();
        assert_eq!(cfg, AppConfig::default());

        let p = tmp.path().join("custom.toml");
        fs::write(&p, "[collector]\nworker_count = 7\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        assert_eq!(load_default().unwrap().collector.worker_count, 7);

        env::set_var("COLLECTOR_WORKER_COUNT", "3");
        assert_eq!(load_default().unwrap().collector.worker_count, 3);

        env::set_var("COLLECTOR_WORKER_COUNT", "lots");
        assert!(load_default().is_err());

        env::remove_var("COLLECTOR_WORKER_COUNT");
        env::remove_var(ENV_CONFIG_PATH);
        env::set_current_dir(&old).unwrap();
    }
}
