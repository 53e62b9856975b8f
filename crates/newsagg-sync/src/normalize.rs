//! Normalizer: raw candidate -> canonical article shape. Pure and deterministic.

use std::collections::HashSet;

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};
use newsagg_core::{CandidateErrorKind, RawCandidate, SourceConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Body characters covered by the fingerprint.
pub const FINGERPRINT_BODY_CHARS: usize = 2000;
pub const EXCERPT_CHARS: usize = 600;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[a-z][^>]*>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static RE_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").expect("paragraph regex"));

/// Genitive month names as they appear in Russian-language datelines.
const RU_MONTHS: [(&str, &str); 12] = [
    ("января", "01"),
    ("февраля", "02"),
    ("марта", "03"),
    ("апреля", "04"),
    ("мая", "05"),
    ("июня", "06"),
    ("июля", "07"),
    ("августа", "08"),
    ("сентября", "09"),
    ("октября", "10"),
    ("ноября", "11"),
    ("декабря", "12"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("title is empty after normalization")]
    EmptyTitle,
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("candidate from {found} offered to the {expected} snapshot")]
    SourceMismatch { expected: String, found: String },
}

impl Rejection {
    pub fn kind(&self) -> CandidateErrorKind {
        CandidateErrorKind::Validation
    }
}

/// A candidate after normalization; identity is not yet resolved against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCandidate {
    pub source_id: String,
    pub canonical_url: String,
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub fingerprint: String,
    pub keywords: Vec<String>,
    pub media_urls: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub published_at_estimated: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Decode entities, strip tags, collapse whitespace to single spaces.
pub fn normalize_text(input: &str) -> String {
    let decoded = html_escape::decode_html_entities(input);
    let stripped = RE_TAGS.replace_all(&decoded, " ");
    RE_WS.replace_all(&stripped, " ").trim().to_string()
}

/// Like [`normalize_text`] but keeps paragraph breaks as `\n\n`.
pub fn normalize_body(input: &str) -> String {
    RE_PARAGRAPH
        .split(input)
        .map(normalize_text)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn char_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn fingerprint(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(char_prefix(body, FINGERPRINT_BODY_CHARS).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn excerpt(body: &str) -> String {
    char_prefix(body, EXCERPT_CHARS).trim_end().to_string()
}

/// Absolute http(s) URL with host, no fragment, and only `keep_query_params` left in the query.
pub fn canonicalize_url(raw: &str, base_url: &str, keep_query_params: &[String]) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty url".into());
    }
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base_url)
            .map_err(|e| format!("base url {base_url:?}: {e}"))?
            .join(raw)
            .map_err(|e| e.to_string())?,
        Err(e) => return Err(e.to_string()),
    };
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("missing host".into());
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| keep_query_params.iter().any(|k| k == key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept.iter());
    }
    Ok(url.to_string())
}

fn localize_months(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    if !RU_MONTHS.iter().any(|(name, _)| lowered.contains(name)) {
        return raw.to_string();
    }
    RU_MONTHS
        .iter()
        .fold(lowered, |acc, (name, number)| acc.replace(name, number))
}

fn has_year(format: &str) -> bool {
    format.contains("%Y") || format.contains("%y") || format.contains("%G")
}

fn has_date(format: &str) -> bool {
    ["%d", "%e", "%m", "%b", "%B", "%j"].iter().any(|f| format.contains(f))
}

fn local_to_utc(offset: FixedOffset, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolve a raw published string. RFC 3339 first, then each format hint in the source's
/// offset. Hints without a year take the fetch year; time-only hints take the fetch date
/// (the previous day if that would land after the fetch).
pub fn parse_published(
    raw: Option<&str>,
    formats: &[String],
    offset: FixedOffset,
    fetched_at: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let text = localize_months(raw);
    let local_fetch = fetched_at.with_timezone(&offset);

    for format in formats {
        if let Ok(parsed) = DateTime::parse_from_str(&text, format) {
            return Some(parsed.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, format) {
            return local_to_utc(offset, naive);
        }
        if let Ok(date) = NaiveDate::parse_from_str(&text, format) {
            return local_to_utc(offset, date.and_time(NaiveTime::MIN));
        }
        if !has_year(format) && has_date(format) {
            let with_year = format!("{} {text}", local_fetch.year());
            let format_with_year = format!("%Y {format}");
            if let Ok(naive) = NaiveDateTime::parse_from_str(&with_year, &format_with_year) {
                return local_to_utc(offset, naive);
            }
        }
        if let Ok(time) = NaiveTime::parse_from_str(&text, format) {
            let resolved = local_to_utc(offset, local_fetch.date_naive().and_time(time))?;
            if resolved > fetched_at + ChronoDuration::minutes(1) {
                return Some(resolved - ChronoDuration::days(1));
            }
            return Some(resolved);
        }
    }
    None
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn normalize_keywords(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|kw| capitalize(&normalize_text(kw)))
        .filter(|kw| !kw.is_empty() && seen.insert(kw.to_lowercase()))
        .collect()
}

fn normalize_media(raw: &[String], base_url: &str) -> Vec<String> {
    let base = Url::parse(base_url).ok();
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|src| match &base {
            Some(base) => base.join(src.trim()).ok(),
            None => Url::parse(src.trim()).ok(),
        })
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|url| url.to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

pub fn normalize(candidate: &RawCandidate, source: &SourceConfig) -> Result<NormalizedCandidate, Rejection> {
    let title = normalize_text(&candidate.title);
    if title.is_empty() {
        return Err(Rejection::EmptyTitle);
    }
    let canonical_url = canonicalize_url(&candidate.origin_url, &source.base_url, &source.keep_query_params)
        .map_err(|reason| Rejection::InvalidUrl {
            url: candidate.origin_url.clone(),
            reason,
        })?;
    let body = normalize_body(&candidate.body);

    let published = parse_published(
        candidate.published_raw.as_deref(),
        &source.time_formats,
        source.utc_offset(),
        candidate.fetched_at,
    );

    Ok(NormalizedCandidate {
        source_id: candidate.source_id.clone(),
        fingerprint: fingerprint(&title, &body),
        excerpt: excerpt(&body),
        keywords: normalize_keywords(&candidate.keywords),
        media_urls: normalize_media(&candidate.media_urls, &canonical_url),
        published_at: published.unwrap_or(candidate.fetched_at),
        published_at_estimated: published.is_none(),
        fetched_at: candidate.fetched_at,
        canonical_url,
        title,
        body,
    })
}
