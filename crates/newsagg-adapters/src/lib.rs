//! Source adapter contract + the selector-driven HTML adapter and its built-in profiles.

use std::collections::HashSet;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use newsagg_core::{
    CandidateErrorKind, ConfigError, HtmlSelectors, ListingMethod, RawCandidate, SourceConfig,
};
use newsagg_storage::{BackoffPolicy, FetchError, FetchRequest, HttpFetcher, RequestPolicy};
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsagg-adapters";

/// Per-run handle passed to adapters: run id for log correlation plus the shared stop flag.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    stop: Arc<AtomicBool>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, stop: Arc<AtomicBool>) -> Self {
        Self { run_id, stop }
    }

    pub fn detached(run_id: Uuid) -> Self {
        Self::new(run_id, Arc::new(AtomicBool::new(false)))
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed content at {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl AdapterError {
    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> CandidateErrorKind {
        match self {
            Self::Fetch(err) if err.is_transient() => CandidateErrorKind::TransientFetch,
            Self::Fetch(_) => CandidateErrorKind::PermanentFetch,
            Self::Malformed { .. } => CandidateErrorKind::MalformedContent,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Lazily walk the source's listing pages, yielding origin URLs in page order.
    /// A failed page yields one `Err` and ends that listing template.
    fn fetch_listing<'a>(
        &'a self,
        source: &'a SourceConfig,
        ctx: &'a AdapterContext,
    ) -> BoxStream<'a, Result<String, AdapterError>>;

    async fn fetch_article(
        &self,
        source: &SourceConfig,
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<RawCandidate, AdapterError>;
}

/// Request knobs derived from a source config snapshot.
pub fn request_policy(source: &SourceConfig) -> RequestPolicy {
    RequestPolicy {
        timeout: source.request_timeout(),
        backoff: BackoffPolicy::default().with_max_retries(source.max_retries),
        rate_limit_per_second: source.rate_limit_per_second,
    }
}

#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    listing_item: Selector,
    listing_link: Selector,
    title: Selector,
    body: Selector,
    published: Option<Selector>,
    published_attr: Option<String>,
    keywords: Option<Selector>,
    media: Option<Selector>,
}

fn compile(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {css:?}: {e}"))
}

fn compile_opt(css: Option<&str>) -> Result<Option<Selector>, String> {
    css.map(compile).transpose()
}

impl CompiledSelectors {
    pub fn compile(selectors: &HtmlSelectors) -> Result<Self, String> {
        Ok(Self {
            listing_item: compile(&selectors.listing_item)?,
            listing_link: compile(&selectors.listing_link)?,
            title: compile(&selectors.title)?,
            body: compile(&selectors.body)?,
            published: compile_opt(selectors.published.as_deref())?,
            published_attr: selectors.published_attr.clone(),
            keywords: compile_opt(selectors.keywords.as_deref())?,
            media: compile_opt(selectors.media.as_deref())?,
        })
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve_href(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    resolved.set_fragment(None);
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

/// Extract article links from one listing page, resolved against the page URL, in page order.
pub fn parse_listing_page(html: &str, page_url: &Url, selectors: &CompiledSelectors) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    document
        .select(&selectors.listing_item)
        .filter_map(|item| item.select(&selectors.listing_link).next())
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| resolve_href(page_url, href))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Parse one article page into a raw candidate. Only a missing title element is fatal here;
/// emptiness checks belong to normalization.
pub fn parse_article(
    html: &str,
    url: &str,
    source_id: &str,
    selectors: &CompiledSelectors,
    fetched_at: DateTime<Utc>,
) -> Result<RawCandidate, AdapterError> {
    let document = Html::parse_document(html);
    let title = document
        .select(&selectors.title)
        .next()
        .map(element_text)
        .ok_or_else(|| AdapterError::malformed(url, "title element not found"))?;

    let body = document
        .select(&selectors.body)
        .map(element_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let published_raw = selectors.published.as_ref().and_then(|selector| {
        let element = document.select(selector).next()?;
        let value = match &selectors.published_attr {
            Some(attr) => element.value().attr(attr)?.trim().to_string(),
            None => element_text(element),
        };
        (!value.is_empty()).then_some(value)
    });

    let keywords = selectors
        .keywords
        .as_ref()
        .map(|selector| {
            let mut seen = HashSet::new();
            document
                .select(selector)
                .map(element_text)
                .filter(|kw| !kw.is_empty() && seen.insert(kw.to_lowercase()))
                .collect()
        })
        .unwrap_or_default();

    let media_urls = match (&selectors.media, Url::parse(url)) {
        (Some(selector), Ok(base)) => {
            let mut seen = HashSet::new();
            document
                .select(selector)
                .filter_map(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
                .filter_map(|src| resolve_href(&base, src))
                .filter(|src| seen.insert(src.clone()))
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(RawCandidate {
        source_id: source_id.to_string(),
        origin_url: url.to_string(),
        title,
        body,
        published_raw,
        keywords,
        media_urls,
        fetched_at,
    })
}

/// Listing HTML from a response body; form-POST listings wrap it in a JSON `data` field.
pub fn listing_html(method: ListingMethod, body: &str, url: &str) -> Result<String, AdapterError> {
    match method {
        ListingMethod::Get => Ok(body.to_string()),
        ListingMethod::PostForm => {
            let value: serde_json::Value = serde_json::from_str(body)
                .map_err(|e| AdapterError::malformed(url, format!("listing response is not JSON: {e}")))?;
            value
                .get("data")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| AdapterError::malformed(url, "listing response has no string `data` field"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageVerdict {
    Continue,
    /// Last page within the configured depth; its links still count.
    DepthReached,
    Empty,
    /// Same links as the first page: the site serves page one for out-of-range pages.
    RepeatsFirstPage,
}

impl PageVerdict {
    pub fn accepts_links(self) -> bool {
        matches!(self, Self::Continue | Self::DepthReached)
    }

    pub fn is_final(self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Pagination state for one listing template.
#[derive(Debug, Clone)]
pub struct ListingCursor {
    page: u32,
    remaining: u32,
    first_page_digest: Option<String>,
}

impl ListingCursor {
    pub fn new(start_page: u32, page_depth: u32) -> Self {
        Self {
            page: start_page,
            remaining: page_depth,
            first_page_digest: None,
        }
    }

    pub fn current_page(&self) -> Option<u32> {
        (self.remaining > 0).then_some(self.page)
    }

    pub fn finish(&mut self) {
        self.remaining = 0;
    }

    pub fn observe(&mut self, links: &[String]) -> PageVerdict {
        if links.is_empty() {
            self.finish();
            return PageVerdict::Empty;
        }
        let digest = hex::encode(Sha256::digest(links.join("\n").as_bytes()));
        match &self.first_page_digest {
            Some(first) if *first == digest => {
                self.finish();
                return PageVerdict::RepeatsFirstPage;
            }
            Some(_) => {}
            None => self.first_page_digest = Some(digest),
        }
        self.page = self.page.saturating_add(1);
        self.remaining -= 1;
        if self.remaining == 0 {
            PageVerdict::DepthReached
        } else {
            PageVerdict::Continue
        }
    }
}

/// Generic adapter driven entirely by CSS selectors.
pub struct HtmlSourceAdapter {
    name: String,
    fetcher: Arc<HttpFetcher>,
    selectors: CompiledSelectors,
}

impl HtmlSourceAdapter {
    pub fn new(name: impl Into<String>, fetcher: Arc<HttpFetcher>, selectors: CompiledSelectors) -> Self {
        Self {
            name: name.into(),
            fetcher,
            selectors,
        }
    }

    async fn fetch_listing_page(
        &self,
        source: &SourceConfig,
        template: &str,
        page: u32,
        ctx: &AdapterContext,
    ) -> Result<Vec<String>, AdapterError> {
        let url = source.listing_page_url(template, page);
        let request = match source.listing_method {
            ListingMethod::Get => FetchRequest::get(&url),
            ListingMethod::PostForm => FetchRequest::post_form(&url, source.listing_post_body(page)),
        };
        let response = self
            .fetcher
            .fetch(ctx.run_id, &source.source_id, &request, &request_policy(source))
            .await?;
        let html = listing_html(source.listing_method, &response.text(), &url)?;
        let page_url = Url::parse(&response.final_url)
            .or_else(|_| Url::parse(&url))
            .map_err(|e| AdapterError::malformed(&url, e.to_string()))?;
        Ok(parse_listing_page(&html, &page_url, &self.selectors))
    }
}

struct ListingWalk<'a> {
    adapter: &'a HtmlSourceAdapter,
    source: &'a SourceConfig,
    ctx: &'a AdapterContext,
    templates: slice::Iter<'a, String>,
    template: Option<&'a str>,
    cursor: ListingCursor,
}

impl<'a> ListingWalk<'a> {
    fn new(adapter: &'a HtmlSourceAdapter, source: &'a SourceConfig, ctx: &'a AdapterContext) -> Self {
        Self {
            adapter,
            source,
            ctx,
            templates: source.listing_urls.iter(),
            template: None,
            cursor: ListingCursor::new(source.start_page, 0),
        }
    }

    async fn next_batch(&mut self) -> Option<Vec<Result<String, AdapterError>>> {
        loop {
            if self.ctx.is_stopping() {
                debug!(source_id = %self.source.source_id, "stop requested; listing walk ends");
                return None;
            }
            let (template, page) = match (self.template, self.cursor.current_page()) {
                (Some(template), Some(page)) => (template, page),
                _ => {
                    self.template = Some(self.templates.next()?.as_str());
                    self.cursor = ListingCursor::new(self.source.start_page, self.source.page_depth);
                    continue;
                }
            };

            match self
                .adapter
                .fetch_listing_page(self.source, template, page, self.ctx)
                .await
            {
                Ok(links) => {
                    let verdict = self.cursor.observe(&links);
                    debug!(
                        source_id = %self.source.source_id,
                        page,
                        links = links.len(),
                        ?verdict,
                        "listing page"
                    );
                    if verdict.accepts_links() {
                        return Some(links.into_iter().map(Ok).collect());
                    }
                }
                Err(err) => {
                    warn!(source_id = %self.source.source_id, page, error = %err, "listing page failed");
                    self.cursor.finish();
                    return Some(vec![Err(err)]);
                }
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlSourceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_listing<'a>(
        &'a self,
        source: &'a SourceConfig,
        ctx: &'a AdapterContext,
    ) -> BoxStream<'a, Result<String, AdapterError>> {
        stream::unfold(ListingWalk::new(self, source, ctx), |mut walk| async move {
            walk.next_batch().await.map(|batch| (batch, walk))
        })
        .flat_map(stream::iter)
        .boxed()
    }

    async fn fetch_article(
        &self,
        source: &SourceConfig,
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<RawCandidate, AdapterError> {
        let response = self
            .fetcher
            .fetch(ctx.run_id, &source.source_id, &FetchRequest::get(url), &request_policy(source))
            .await?;
        parse_article(&response.text(), url, &source.source_id, &self.selectors, Utc::now())
    }
}

pub const BUILTIN_PROFILES: &[&str] = &["rt-ru", "aif-ru", "svpressa-ru"];

/// Selector set for a built-in source profile.
pub fn profile_selectors(profile: &str) -> Option<HtmlSelectors> {
    let selectors = match profile {
        "rt-ru" => HtmlSelectors {
            listing_item: "li.listing__column".into(),
            listing_link: "a.link".into(),
            title: "h1.article__heading".into(),
            body: "div.article__summary, div.article__text > p, div.article__text > h2, \
                   div.article__text > h3, div.article__text > blockquote"
                .into(),
            published: Some("time.date".into()),
            published_attr: Some("datetime".into()),
            keywords: Some("a.tags-trends__link".into()),
            media: Some("img.article__cover-image".into()),
        },
        "aif-ru" => HtmlSelectors {
            listing_item: "div.list_item".into(),
            listing_link: "div.box_info a".into(),
            title: "h1[itemprop=headline]".into(),
            body: "div.article_text > p, div.article_text > h2, div.article_text > h3".into(),
            published: Some("time[itemprop=datePublished]".into()),
            published_attr: None,
            keywords: Some("span[itemprop=keywords]".into()),
            media: Some("img[itemprop=image]".into()),
        },
        "svpressa-ru" => HtmlSelectors {
            listing_item: "article.b-article_item".into(),
            listing_link: "a.b-article__title".into(),
            title: "h1.b-text__title".into(),
            body: "div.b-text__block > p".into(),
            published: Some("div.b-text__date".into()),
            published_attr: None,
            keywords: Some("a.b-tag__link".into()),
            media: Some("div.b-text__img img".into()),
        },
        _ => return None,
    };
    Some(selectors)
}

/// Build the adapter a source config names. Explicit `selectors` override a profile's.
pub fn adapter_for_source(
    source: &SourceConfig,
    fetcher: Arc<HttpFetcher>,
) -> Result<Arc<dyn SourceAdapter>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidSource {
        source_id: source.source_id.clone(),
        message,
    };
    let selectors = match (source.adapter.as_str(), &source.selectors) {
        ("html", Some(explicit)) => explicit.clone(),
        ("html", None) => return Err(invalid("adapter `html` requires selectors".into())),
        (profile, explicit) => {
            let base = profile_selectors(profile)
                .ok_or_else(|| invalid(format!("unknown adapter {profile:?}")))?;
            explicit.clone().unwrap_or(base)
        }
    };
    let compiled = CompiledSelectors::compile(&selectors).map_err(invalid)?;
    info!(source_id = %source.source_id, adapter = %source.adapter, "adapter ready");
    Ok(Arc::new(HtmlSourceAdapter::new(source.adapter.clone(), fetcher, compiled)))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use chrono::TimeZone;
    use newsagg_storage::HttpClientConfig;

    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(profile: &str, file: &str) -> String {
        let path = workspace_root().join("fixtures").join(profile).join(file);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn selectors(profile: &str) -> CompiledSelectors {
        CompiledSelectors::compile(&profile_selectors(profile).unwrap()).unwrap()
    }

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).single().unwrap()
    }

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    #[test]
    fn rt_listing_links_resolve_against_page_url() {
        let page = Url::parse("https://russian.rt.com/listing/type.ArticleVideoGallery.trend.politics/prepare/all-trends-new/50/0").unwrap();
        let links = parse_listing_page(&fixture("rt-ru", "listing.html"), &page, &selectors("rt-ru"));
        assert_eq!(
            links,
            vec![
                "https://russian.rt.com/world/news/1001-summit-opens".to_string(),
                "https://russian.rt.com/russia/news/1002-budget-vote".to_string(),
                "https://russian.rt.com/world/news/1003-port-reopens".to_string(),
            ]
        );
    }

    #[test]
    fn rt_article_parses_fields() {
        let url = "https://russian.rt.com/world/news/1001-summit-opens";
        let candidate = parse_article(&fixture("rt-ru", "article.html"), url, "rt-politics", &selectors("rt-ru"), fetched_at()).unwrap();
        assert_eq!(candidate.title, "Summit opens in Geneva");
        assert!(candidate.body.starts_with("Leaders gathered on Monday."));
        assert!(candidate.body.contains("\n\nTalks are expected to last two days."));
        assert_eq!(candidate.published_raw.as_deref(), Some("2026-03-9 10:15"));
        assert_eq!(candidate.keywords, vec!["Diplomacy".to_string(), "Europe".to_string()]);
        assert_eq!(candidate.media_urls, vec!["https://cdn.rt.com/images/summit.jpg".to_string()]);
        assert_eq!(candidate.origin_url, url);
        assert_eq!(candidate.fetched_at, fetched_at());
    }

    #[test]
    fn aif_post_listing_unwraps_json_data() {
        let body = fixture("aif-ru", "listing.json");
        let html = listing_html(ListingMethod::PostForm, &body, "https://aif.ru/politics").unwrap();
        let page = Url::parse("https://aif.ru/politics").unwrap();
        let links = parse_listing_page(&html, &page, &selectors("aif-ru"));
        assert_eq!(
            links,
            vec![
                "https://aif.ru/politics/world/tariffs-review".to_string(),
                "https://aif.ru/politics/russia/regional-elections".to_string(),
            ]
        );
    }

    #[test]
    fn aif_article_uses_element_text_for_time() {
        let url = "https://aif.ru/politics/world/tariffs-review";
        let candidate = parse_article(&fixture("aif-ru", "article.html"), url, "aif-politics", &selectors("aif-ru"), fetched_at()).unwrap();
        assert_eq!(candidate.title, "Tariffs under review");
        assert_eq!(candidate.published_raw.as_deref(), Some("14.03.2026 09:40"));
        assert_eq!(candidate.keywords, vec!["trade".to_string(), "tariffs".to_string()]);
        assert_eq!(candidate.media_urls, vec!["https://aif.ru/img/tariffs.jpg".to_string()]);
    }

    #[test]
    fn svpressa_listing_and_article_parse() {
        let page = Url::parse("https://svpressa.ru/politic/?page=1").unwrap();
        let links = parse_listing_page(&fixture("svpressa-ru", "listing.html"), &page, &selectors("svpressa-ru"));
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.starts_with("https://svpressa.ru/politic/article/")));

        let candidate = parse_article(&fixture("svpressa-ru", "article.html"), &links[0], "svpressa-politic", &selectors("svpressa-ru"), fetched_at()).unwrap();
        assert_eq!(candidate.title, "Parliament debates energy bill");
        assert_eq!(candidate.published_raw.as_deref(), Some("13 марта 2026 18:05"));
        assert_eq!(candidate.body.split("\n\n").count(), 2);
    }

    #[test]
    fn missing_title_is_malformed() {
        let err = parse_article("<html><body><p>no heading</p></body></html>", "https://a/1", "s", &selectors("rt-ru"), fetched_at())
            .unwrap_err();
        assert_eq!(err.kind(), CandidateErrorKind::MalformedContent);
    }

    #[test]
    fn post_listing_without_data_is_malformed() {
        assert!(matches!(
            listing_html(ListingMethod::PostForm, r#"{"items": []}"#, "https://aif.ru/x"),
            Err(AdapterError::Malformed { .. })
        ));
        assert!(listing_html(ListingMethod::PostForm, "<html/>", "https://aif.ru/x").is_err());
    }

    #[test]
    fn fetch_errors_split_by_status() {
        let status = |status| {
            AdapterError::Fetch(FetchError::HttpStatus {
                status,
                url: "https://aif.ru/x".into(),
                attempts: 1,
            })
        };
        assert_eq!(status(404).kind(), CandidateErrorKind::PermanentFetch);
        assert_eq!(status(410).kind(), CandidateErrorKind::PermanentFetch);
        assert_eq!(status(503).kind(), CandidateErrorKind::TransientFetch);
        assert_eq!(status(429).kind(), CandidateErrorKind::TransientFetch);
    }

    #[test]
    fn non_http_links_are_skipped_and_fragments_dropped() {
        let html = r#"<ul>
            <li class="listing__column"><a class="link" href="javascript:void(0)">x</a></li>
            <li class="listing__column"><a class="link" href="/a">a</a></li>
            <li class="listing__column"><a class="link" href="/a#comments">a again</a></li>
        </ul>"#;
        let page = Url::parse("https://russian.rt.com/listing/0").unwrap();
        let links = parse_listing_page(html, &page, &selectors("rt-ru"));
        assert_eq!(links, vec!["https://russian.rt.com/a".to_string()]);
    }

    #[test]
    fn cursor_stops_at_depth() {
        let mut cursor = ListingCursor::new(0, 2);
        assert_eq!(cursor.current_page(), Some(0));
        assert_eq!(cursor.observe(&["a".into()]), PageVerdict::Continue);
        assert_eq!(cursor.current_page(), Some(1));
        assert_eq!(cursor.observe(&["b".into()]), PageVerdict::DepthReached);
        assert_eq!(cursor.current_page(), None);
    }

    #[test]
    fn cursor_stops_on_empty_or_repeated_first_page() {
        let mut cursor = ListingCursor::new(1, 10);
        assert_eq!(cursor.observe(&["a".into(), "b".into()]), PageVerdict::Continue);
        assert_eq!(cursor.observe(&["c".into()]), PageVerdict::Continue);
        let verdict = cursor.observe(&["a".into(), "b".into()]);
        assert_eq!(verdict, PageVerdict::RepeatsFirstPage);
        assert!(!verdict.accepts_links());
        assert_eq!(cursor.current_page(), None);

        let mut empty = ListingCursor::new(1, 10);
        assert_eq!(empty.observe(&[]), PageVerdict::Empty);
        assert_eq!(empty.current_page(), None);
    }

    #[test]
    fn registry_resolves_profiles_and_rejects_unknown() {
        let mut source = SourceConfig::new("rt-politics", "rt-ru", "https://russian.rt.com/");
        source.listing_urls = vec!["https://russian.rt.com/listing/{page}".into()];
        let adapter = adapter_for_source(&source, fetcher()).unwrap();
        assert_eq!(adapter.name(), "rt-ru");

        source.adapter = "html".into();
        assert!(matches!(adapter_for_source(&source, fetcher()), Err(ConfigError::InvalidSource { .. })));

        source.adapter = "lenta-ru".into();
        assert!(adapter_for_source(&source, fetcher()).is_err());

        source.adapter = "html".into();
        let mut custom = profile_selectors("svpressa-ru").unwrap();
        custom.title = "h1[".into();
        source.selectors = Some(custom);
        let err = adapter_for_source(&source, fetcher()).err().unwrap();
        assert!(err.to_string().contains("invalid selector"));
    }

    #[tokio::test]
    async fn stopped_context_yields_empty_listing() {
        let mut source = SourceConfig::new("rt-politics", "rt-ru", "https://russian.rt.com/");
        source.listing_urls = vec!["http://127.0.0.1:9/listing/{page}".into()];
        let adapter = adapter_for_source(&source, fetcher()).unwrap();
        let ctx = AdapterContext::new(Uuid::new_v4(), Arc::new(AtomicBool::new(true)));
        let urls: Vec<_> = adapter.fetch_listing(&source, &ctx).collect().await;
        assert!(urls.is_empty());
    }
}
