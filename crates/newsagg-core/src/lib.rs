//! Core data model for the news ingestion pipeline.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsagg-core";

/// Namespace for deterministic article ids (UUIDv5 over source + canonical URL).
const ARTICLE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e65_7773_6167_4000_8000_6172_7469_636c);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid interval format: {0:?} (expected e.g. 15m, 1h30m, 1d)")]
    InvalidInterval(String),
    #[error("interval must be greater than zero: {0:?}")]
    ZeroInterval(String),
    #[error("source {source_id}: {message}")]
    InvalidSource { source_id: String, message: String },
}

/// Human-readable fetch interval made of day/hour/minute components (`1d`, `2h30m`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FetchInterval(Duration);

impl FetchInterval {
    pub fn from_minutes(minutes: u64) -> Self {
        Self(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for FetchInterval {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let raw = input.trim();
        let invalid = || ConfigError::InvalidInterval(raw.to_string());
        if raw.is_empty() {
            return Err(invalid());
        }

        let mut days: Option<u64> = None;
        let mut hours: Option<u64> = None;
        let mut minutes: Option<u64> = None;
        let mut digits = String::new();

        for ch in raw.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            if digits.is_empty() {
                return Err(invalid());
            }
            let value: u64 = digits.parse().map_err(|_| invalid())?;
            digits.clear();
            let slot = match ch {
                'd' => &mut days,
                'h' => &mut hours,
                'm' => &mut minutes,
                _ => return Err(invalid()),
            };
            if slot.replace(value).is_some() {
                return Err(invalid());
            }
        }
        if !digits.is_empty() {
            return Err(invalid());
        }

        let total = days
            .unwrap_or(0)
            .checked_mul(86_400)
            .and_then(|d| hours.unwrap_or(0).checked_mul(3_600).and_then(|h| d.checked_add(h)))
            .and_then(|dh| minutes.unwrap_or(0).checked_mul(60).and_then(|m| dh.checked_add(m)))
            .ok_or_else(invalid)?;
        if total == 0 {
            return Err(ConfigError::ZeroInterval(raw.to_string()));
        }
        Ok(Self(Duration::from_secs(total)))
    }
}

impl TryFrom<String> for FetchInterval {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FetchInterval> for String {
    fn from(value: FetchInterval) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FetchInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secs = self.0.as_secs();
        let days = secs / 86_400;
        secs %= 86_400;
        let hours = secs / 3_600;
        secs %= 3_600;
        let minutes = secs / 60;
        secs %= 60;

        let mut out = String::new();
        if days > 0 {
            out.push_str(&format!("{days}d"));
        }
        if hours > 0 {
            out.push_str(&format!("{hours}h"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}m"));
        }
        if secs > 0 || out.is_empty() {
            out.push_str(&format!("{secs}s"));
        }
        f.write_str(&out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingMethod {
    #[default]
    Get,
    /// Form POST whose JSON response wraps the listing HTML in a `data` field.
    PostForm,
}

/// CSS selectors driving the generic HTML adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSelectors {
    pub listing_item: String,
    pub listing_link: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub published: Option<String>,
    /// Attribute holding the timestamp; falls back to element text when absent.
    #[serde(default)]
    pub published_attr: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_start_page() -> u32 {
    1
}

fn default_page_depth() -> u32 {
    5
}

fn default_interval() -> FetchInterval {
    FetchInterval::from_minutes(60)
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_max_retries() -> usize {
    2
}

/// Per-source ingestion settings. Treated as an immutable snapshot for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub adapter: String,
    pub base_url: String,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default = "default_start_page")]
    pub start_page: u32,
    #[serde(default = "default_page_depth")]
    pub page_depth: u32,
    #[serde(default = "default_interval")]
    pub interval: FetchInterval,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default)]
    pub rate_limit_per_second: Option<f64>,
    #[serde(default)]
    pub time_formats: Vec<String>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub keep_query_params: Vec<String>,
    #[serde(default)]
    pub listing_method: ListingMethod,
    #[serde(default)]
    pub post_body: Option<String>,
    #[serde(default)]
    pub selectors: Option<HtmlSelectors>,
}

impl SourceConfig {
    /// Minimal config used by tests and programmatic registration.
    pub fn new(source_id: impl Into<String>, adapter: impl Into<String>, base_url: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            display_name: source_id.clone(),
            source_id,
            enabled: true,
            adapter: adapter.into(),
            base_url: base_url.into(),
            listing_urls: Vec::new(),
            start_page: default_start_page(),
            page_depth: default_page_depth(),
            interval: default_interval(),
            cron: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            rate_limit_per_second: None,
            time_formats: Vec::new(),
            utc_offset_minutes: 0,
            keep_query_params: Vec::new(),
            listing_method: ListingMethod::Get,
            post_body: None,
            selectors: None,
        }
    }

    pub fn listing_page_url(&self, template: &str, page: u32) -> String {
        template.replace("{page}", &page.to_string())
    }

    pub fn listing_post_body(&self, page: u32) -> String {
        self.post_body
            .as_deref()
            .unwrap_or("page={page}")
            .replace("{page}", &page.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Offset applied to naive source timestamps; out-of-range values fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: &str| ConfigError::InvalidSource {
            source_id: self.source_id.clone(),
            message: message.to_string(),
        };
        if self.source_id.trim().is_empty() {
            return Err(fail("source_id is empty"));
        }
        if self.listing_urls.is_empty() {
            return Err(fail("no listing_urls configured"));
        }
        if self.page_depth == 0 {
            return Err(fail("page_depth must be at least 1"));
        }
        if matches!(self.rate_limit_per_second, Some(rate) if rate <= 0.0 || !rate.is_finite()) {
            return Err(fail("rate_limit_per_second must be positive"));
        }
        Ok(())
    }
}

/// Ephemeral, source-specific article as discovered by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_id: String,
    pub origin_url: String,
    pub title: String,
    pub body: String,
    pub published_raw: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Durable, deduplicated article record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalArticle {
    pub id: Uuid,
    pub source_id: String,
    pub canonical_url: String,
    pub title: String,
    pub excerpt: String,
    pub fingerprint: String,
    pub keywords: Vec<String>,
    pub media_urls: Vec<String>,
    pub published_at: DateTime<Utc>,
    /// True when the source omitted a usable timestamp and ingestion time was used.
    pub published_at_estimated: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub version: u32,
}

pub fn article_id_for(source_id: &str, canonical_url: &str) -> Uuid {
    Uuid::new_v5(
        &ARTICLE_ID_NAMESPACE,
        format!("{source_id}\n{canonical_url}").as_bytes(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartialFailure,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
        }
    }

    /// Partial failures keep the schedule healthy just like successes.
    pub fn is_schedule_healthy(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "partial_failure" => Ok(Self::PartialFailure),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run outcome {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Forced,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub discovered: u32,
    pub fetched: u32,
    pub new: u32,
    pub updated: u32,
    pub duplicate: u32,
    pub rejected: u32,
    pub skipped: u32,
}

impl RunCounts {
    pub fn committed(&self) -> u32 {
        self.new + self.updated + self.duplicate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateErrorKind {
    /// Timeouts, connection errors, 429 and 5xx; worth retrying next run.
    TransientFetch,
    /// 4xx and other responses a retry will not change.
    PermanentFetch,
    MalformedContent,
    Validation,
    CommitConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRejection {
    pub url: String,
    pub kind: CandidateErrorKind,
    pub message: String,
}

/// Terminal record of one ingestion run; written once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub source_id: String,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
    pub error_summary: Option<String>,
    #[serde(default)]
    pub rejections: Vec<CandidateRejection>,
}
