#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use newsagg_adapters::{AdapterContext, AdapterError, SourceAdapter};
use newsagg_core::{RawCandidate, SourceConfig};
use newsagg_storage::{FetchError, MemoryStore, StoreGateway};
use newsagg_sync::{MemoryTelemetry, RunCoordinator, Scheduler, DEFAULT_RUN_TIMEOUT};
use tokio::sync::{Notify, Semaphore};

pub const PUBLISHED: &str = "2026-03-14T09:00:00Z";

pub fn source(source_id: &str) -> SourceConfig {
    let mut config = SourceConfig::new(source_id, "scripted", "https://example.org");
    config.listing_urls = vec![format!("https://example.org/{source_id}/news?page={{page}}")];
    config
}

pub fn article_url(source_id: &str, n: usize) -> String {
    format!("https://example.org/{source_id}/a/{n}")
}

/// In-process adapter whose listing and articles are set by the test.
#[derive(Default)]
pub struct ScriptedAdapter {
    source_id: String,
    listing: Mutex<Vec<String>>,
    listing_fails: AtomicBool,
    panics: AtomicBool,
    articles: Mutex<HashMap<String, (String, String)>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    entered: Notify,
    listing_calls: AtomicUsize,
    article_calls: AtomicUsize,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl ScriptedAdapter {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    /// `count` distinct articles; titles and bodies do not mention the source.
    pub fn with_articles(source_id: &str, count: usize) -> Self {
        let adapter = Self::new(source_id);
        for n in 1..=count {
            adapter.set_article(&article_url(source_id, n), &format!("Story {n}"), &format!("Body of story {n}."));
        }
        adapter
    }

    pub fn logging_to(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn set_article(&self, url: &str, title: &str, body: &str) {
        let mut listing = self.listing.lock().unwrap();
        if !listing.iter().any(|u| u == url) {
            listing.push(url.to_string());
        }
        self.articles
            .lock()
            .unwrap()
            .insert(url.to_string(), (title.to_string(), body.to_string()));
    }

    /// Listed but every fetch of it fails with a 503.
    pub fn add_failing_url(&self, url: &str) {
        self.listing.lock().unwrap().push(url.to_string());
    }

    pub fn fail_listing(&self, fails: bool) {
        self.listing_fails.store(fails, Ordering::SeqCst);
    }

    pub fn panic_on_listing(&self, panics: bool) {
        self.panics.store(panics, Ordering::SeqCst);
    }

    /// Block article fetches until `release` hands out permits.
    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(permits);
        }
    }

    /// Resolves once an article fetch has started.
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("adapter never reached an article fetch");
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn article_calls(&self) -> usize {
        self.article_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch_listing<'a>(
        &'a self,
        source: &'a SourceConfig,
        _ctx: &'a AdapterContext,
    ) -> BoxStream<'a, Result<String, AdapterError>> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.source_id.clone());
        }
        if self.panics.load(Ordering::SeqCst) {
            panic!("scripted listing panic for {}", source.source_id);
        }
        let items: Vec<Result<String, AdapterError>> = if self.listing_fails.load(Ordering::SeqCst) {
            vec![Err(AdapterError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: source.listing_page_url(&source.listing_urls[0], source.start_page),
                attempts: 3,
            }))]
        } else {
            self.listing.lock().unwrap().iter().cloned().map(Ok).collect()
        };
        stream::iter(items).boxed()
    }

    async fn fetch_article(
        &self,
        source: &SourceConfig,
        url: &str,
        _ctx: &AdapterContext,
    ) -> Result<RawCandidate, AdapterError> {
        self.entered.notify_one();
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.article_calls.fetch_add(1, Ordering::SeqCst);

        let article = self.articles.lock().unwrap().get(url).cloned();
        match article {
            Some((title, body)) => Ok(RawCandidate {
                source_id: source.source_id.clone(),
                origin_url: url.to_string(),
                title,
                body,
                published_raw: Some(PUBLISHED.to_string()),
                keywords: vec![],
                media_urls: vec![],
                fetched_at: Utc::now(),
            }),
            None => Err(AdapterError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
                attempts: 3,
            })),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<StoreGateway>,
    pub telemetry: Arc<MemoryTelemetry>,
    pub coordinator: Arc<RunCoordinator>,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self::with_timeout(max_concurrent_runs, DEFAULT_RUN_TIMEOUT)
    }

    pub fn with_timeout(max_concurrent_runs: usize, run_timeout: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(StoreGateway::new(store.clone(), Some(Duration::from_secs(60))));
        let telemetry = Arc::new(MemoryTelemetry::new());
        let coordinator =
            Arc::new(RunCoordinator::new(gateway.clone(), telemetry.clone()).with_run_timeout(run_timeout));
        let scheduler = Scheduler::new(coordinator.clone(), telemetry.clone(), max_concurrent_runs);
        Self {
            store,
            gateway,
            telemetry,
            coordinator,
            scheduler,
        }
    }

    pub async fn add(&self, adapter: Arc<ScriptedAdapter>) -> Arc<ScriptedAdapter> {
        self.scheduler
            .register(source(&adapter.source_id), adapter.clone())
            .await
            .expect("register scripted source");
        adapter
    }
}
