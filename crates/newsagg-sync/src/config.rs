//! Source registry (`sources.yaml`) and process-level settings from the environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use newsagg_core::{ConfigError, SourceConfig};
use newsagg_storage::HttpClientConfig;
use serde::Deserialize;
use tokio::fs;
use tracing::warn;
use url::Url;

use crate::coordinator::DEFAULT_RUN_TIMEOUT;

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    sources: Vec<serde_yaml::Value>,
}

/// Parsed registry. Broken entries are reported individually and never block the others.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    pub rejected: Vec<ConfigError>,
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut registry = Self::default();
        let mut seen = HashSet::new();

        for (index, value) in raw.sources.into_iter().enumerate() {
            let label = value
                .get("source_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{index}"));
            let source = match serde_yaml::from_value::<SourceConfig>(value) {
                Ok(source) => source,
                Err(err) => {
                    registry.reject(ConfigError::InvalidSource {
                        source_id: label,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if let Err(err) = check_source(&source) {
                registry.reject(err);
                continue;
            }
            if !seen.insert(source.source_id.clone()) {
                registry.reject(ConfigError::InvalidSource {
                    source_id: source.source_id.clone(),
                    message: "duplicate source_id".to_string(),
                });
                continue;
            }
            registry.sources.push(source);
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    fn reject(&mut self, err: ConfigError) {
        warn!(error = %err, "source excluded from registry");
        self.rejected.push(err);
    }
}

/// Validation beyond the model's own checks: URLs must parse.
pub fn check_source(source: &SourceConfig) -> Result<(), ConfigError> {
    source.validate()?;
    let invalid = |message: String| ConfigError::InvalidSource {
        source_id: source.source_id.clone(),
        message,
    };
    Url::parse(&source.base_url).map_err(|e| invalid(format!("base_url: {e}")))?;
    for template in &source.listing_urls {
        let probe = source.listing_page_url(template, source.start_page);
        Url::parse(&probe).map_err(|e| invalid(format!("listing url {template:?}: {e}")))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Postgres when set; the in-memory store otherwise.
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub max_concurrent_runs: usize,
    pub run_timeout: Duration,
    pub user_agent: Option<String>,
    pub cache_ttl: Option<Duration>,
    pub telemetry_dir: Option<PathBuf>,
    pub run_on_start: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sources_path: PathBuf::from("sources.yaml"),
            max_concurrent_runs: default_parallelism(),
            run_timeout: DEFAULT_RUN_TIMEOUT,
            user_agent: None,
            cache_ttl: Some(Duration::from_secs(1800)),
            telemetry_dir: None,
            run_on_start: false,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str| non_empty(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            database_url: non_empty("DATABASE_URL"),
            sources_path: non_empty("NEWSAGG_SOURCES")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_path),
            max_concurrent_runs: number("NEWSAGG_MAX_CONCURRENT_RUNS")
                .map(|n| (n as usize).max(1))
                .unwrap_or(defaults.max_concurrent_runs),
            run_timeout: number("NEWSAGG_RUN_TIMEOUT_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            user_agent: non_empty("NEWSAGG_USER_AGENT"),
            cache_ttl: match number("NEWSAGG_CACHE_TTL_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.cache_ttl,
            },
            telemetry_dir: non_empty("NEWSAGG_TELEMETRY_DIR").map(PathBuf::from),
            run_on_start: non_empty("NEWSAGG_RUN_ON_START")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use newsagg_core::FetchInterval;

    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: rt-ru
    adapter: rt-ru
    base_url: https://russian.rt.com
    listing_urls: ["https://russian.rt.com/listing/type.News/prepare/all-news/15/{page}"]
    interval: 30m
  - source_id: broken-interval
    adapter: html
    base_url: https://example.org
    listing_urls: ["https://example.org/news"]
    interval: soon
  - source_id: no-listing
    adapter: html
    base_url: https://example.org
  - source_id: bad-base
    adapter: html
    base_url: "not a url"
    listing_urls: ["https://example.org/news"]
  - source_id: rt-ru
    adapter: rt-ru
    base_url: https://russian.rt.com
    listing_urls: ["https://russian.rt.com/news"]
"#;

    #[test]
    fn bad_entries_are_isolated() {
        let registry = SourceRegistry::parse(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 1);
        let rt = registry.get("rt-ru").unwrap();
        assert_eq!(rt.interval, FetchInterval::from_minutes(30));
        assert_eq!(registry.rejected.len(), 4);
        let rejected: Vec<String> = registry.rejected.iter().map(|e| e.to_string()).collect();
        assert!(rejected.iter().any(|m| m.starts_with("source broken-interval")));
        assert!(rejected.iter().any(|m| m.contains("no listing_urls")));
        assert!(rejected.iter().any(|m| m.contains("base_url")));
        assert!(rejected.iter().any(|m| m.contains("duplicate source_id")));
    }

    #[test]
    fn bundled_registry_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::parse(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert!(registry.rejected.is_empty(), "{:?}", registry.rejected);
        let ids: Vec<_> = registry.sources.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(ids, ["rt-ru", "aif-ru", "svpressa-ru"]);
        assert!(registry.get("svpressa-ru").unwrap().cron.is_some());
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(SourceRegistry::parse("sources: [unclosed").is_err());
        assert!(SourceRegistry::parse("sources: []").unwrap().sources.is_empty());
    }

    #[test]
    fn env_overrides_and_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/news"),
            ("NEWSAGG_MAX_CONCURRENT_RUNS", "3"),
            ("NEWSAGG_RUN_TIMEOUT_SECS", "60"),
            ("NEWSAGG_CACHE_TTL_SECS", "0"),
            ("NEWSAGG_RUN_ON_START", "true"),
            ("NEWSAGG_USER_AGENT", "  "),
        ]);
        let config = PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/news"));
        assert_eq!(config.max_concurrent_runs, 3);
        assert_eq!(config.run_timeout, Duration::from_secs(60));
        assert_eq!(config.cache_ttl, None);
        assert!(config.run_on_start);
        assert_eq!(config.user_agent, None);
        assert_eq!(config.sources_path, PathBuf::from("sources.yaml"));

        let empty = PipelineConfig::from_lookup(|_| None);
        assert_eq!(empty.database_url, None);
        assert_eq!(empty.run_timeout, DEFAULT_RUN_TIMEOUT);
        assert_eq!(empty.cache_ttl, Some(Duration::from_secs(1800)));
        assert!(empty.max_concurrent_runs >= 1);
    }
}
