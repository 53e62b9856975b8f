//! HTTP fetch utilities: bounded retries, backoff, per-source limits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry policy: `max_retries` extra attempts with capped exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_retries(self, max_retries: usize) -> Self {
        Self { max_retries, ..self }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Per-request knobs taken from the source config snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RequestPolicy {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub rate_limit_per_second: Option<f64>,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            rate_limit_per_second: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Fixed user agent; when unset the fetcher rotates through browser agents.
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            user_agent: None,
            global_concurrency: 50,
            per_source_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    pub fn per_second(rate: f64) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        Self {
            capacity: (rate.ceil() as u32).max(1),
            refill_every: Duration::from_secs_f64(1.0 / rate),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_nanos() > 0 {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    PostForm(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: FetchMethod,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Get,
        }
    }

    pub fn post_form(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::PostForm(body.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// Timeouts, connection failures and 5xx/429 responses; the rest are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            Self::Closed => true,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    rotate_user_agents: bool,
    next_user_agent: AtomicUsize,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    buckets: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            rotate_user_agents: config.user_agent.is_none(),
            next_user_agent: AtomicUsize::new(0),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn rate_limiter(&self, source_id: &str, rate: Option<f64>) -> Option<Arc<SimpleTokenBucket>> {
        let rate = rate?;
        let mut map = self.buckets.lock().await;
        Some(
            map.entry(source_id.to_string())
                .or_insert_with(|| Arc::new(SimpleTokenBucket::new(TokenBucketConfig::per_second(rate))))
                .clone(),
        )
    }

    fn user_agent(&self) -> Option<&'static str> {
        if !self.rotate_user_agents {
            return None;
        }
        let index = self.next_user_agent.fetch_add(1, Ordering::Relaxed) % BROWSER_USER_AGENTS.len();
        Some(BROWSER_USER_AGENTS[index])
    }

    fn build_request(&self, request: &FetchRequest, timeout: Duration) -> reqwest::RequestBuilder {
        let builder = match &request.method {
            FetchMethod::Get => self.client.get(&request.url),
            FetchMethod::PostForm(body) => self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header("X-Requested-With", "XMLHttpRequest")
                .body(body.clone()),
        };
        let builder = builder
            .timeout(timeout)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            );
        match self.user_agent() {
            Some(agent) => builder.header(reqwest::header::USER_AGENT, agent),
            None => builder,
        }
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
        policy: &RequestPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        self.fetch_with_retries(source_id, request, policy)
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(
        &self,
        source_id: &str,
        request: &FetchRequest,
        policy: &RequestPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let Ok(_global) = self.global_limit.acquire().await else {
            return Err(FetchError::Closed);
        };
        let per_source = self.per_source_semaphore(source_id).await;
        let Ok(_source) = per_source.acquire().await else {
            return Err(FetchError::Closed);
        };
        let bucket = self.rate_limiter(source_id, policy.rate_limit_per_second).await;

        let backoff = policy.backoff;
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &bucket {
                bucket.take().await;
            }
            let attempts = attempt + 1;
            let resp_result = self.build_request(request, policy.timeout).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(bytes) => {
                                debug!(attempts, bytes = bytes.len(), "fetched");
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: bytes.to_vec(),
                                });
                            }
                            Err(err) => {
                                if classify_reqwest_error(&err) == RetryDisposition::Retryable
                                    && attempt < backoff.max_retries
                                {
                                    warn!(attempts, error = %err, "body read failed; retrying");
                                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                                    attempt += 1;
                                    continue;
                                }
                                return Err(FetchError::Request {
                                    url: request.url.clone(),
                                    attempts,
                                    source: err,
                                });
                            }
                        }
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(attempts, status = status.as_u16(), "retryable status");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        attempts,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(attempts, error = %err, "request failed; retrying");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        url: request.url.clone(),
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }
}
