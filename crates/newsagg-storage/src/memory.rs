//! Process-local store: copy-on-write per-source tables behind per-source write locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use newsagg_core::{CanonicalArticle, RunRecord};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::store::{ArticleStore, ArticleWrite, StoreError, WriteOutcome};

#[derive(Debug, Clone, Default)]
struct SourceTable {
    articles: HashMap<Uuid, CanonicalArticle>,
}

impl SourceTable {
    fn fingerprint_owner(&self, fingerprint: &str) -> Option<Uuid> {
        self.articles
            .values()
            .find(|a| a.fingerprint == fingerprint)
            .map(|a| a.id)
    }

    fn url_owner(&self, canonical_url: &str) -> Option<Uuid> {
        self.articles
            .values()
            .find(|a| a.canonical_url == canonical_url)
            .map(|a| a.id)
    }

    fn apply(&mut self, source_id: &str, write: &ArticleWrite) -> WriteOutcome {
        match write {
            ArticleWrite::Insert(article) => {
                if article.source_id != source_id {
                    return WriteOutcome::Conflict(format!(
                        "article belongs to {} not {source_id}",
                        article.source_id
                    ));
                }
                if self.articles.contains_key(&article.id) {
                    return WriteOutcome::Conflict(format!("article {} already exists", article.id));
                }
                if let Some(owner) = self.fingerprint_owner(&article.fingerprint) {
                    return WriteOutcome::Conflict(format!("fingerprint already held by {owner}"));
                }
                if let Some(owner) = self.url_owner(&article.canonical_url) {
                    return WriteOutcome::Conflict(format!("url already held by {owner}"));
                }
                self.articles.insert(article.id, article.clone());
                WriteOutcome::Applied
            }
            ArticleWrite::Revise(revision) => {
                if let Some(owner) = self.fingerprint_owner(&revision.fingerprint) {
                    if owner != revision.id {
                        return WriteOutcome::Conflict(format!("fingerprint already held by {owner}"));
                    }
                }
                let Some(article) = self.articles.get_mut(&revision.id) else {
                    return WriteOutcome::Conflict(format!("article {} not found", revision.id));
                };
                article.title = revision.title.clone();
                article.excerpt = revision.excerpt.clone();
                article.fingerprint = revision.fingerprint.clone();
                article.keywords = revision.keywords.clone();
                article.media_urls = revision.media_urls.clone();
                article.published_at = revision.published_at;
                article.published_at_estimated = revision.published_at_estimated;
                article.last_seen_at = article.last_seen_at.max(revision.seen_at);
                article.version += 1;
                WriteOutcome::Applied
            }
            ArticleWrite::Touch { id, seen_at } => {
                let Some(article) = self.articles.get_mut(id) else {
                    return WriteOutcome::Conflict(format!("article {id} not found"));
                };
                article.last_seen_at = article.last_seen_at.max(*seen_at);
                WriteOutcome::Applied
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Arc<SourceTable>>>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    runs: RwLock<HashMap<String, Vec<RunRecord>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    async fn lock_source(&self, source_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.write_locks.lock().await;
            locks
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn table(&self, source_id: &str) -> Arc<SourceTable> {
        self.tables
            .read()
            .await
            .get(source_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn load_articles(&self, source_id: &str) -> Result<Vec<CanonicalArticle>, StoreError> {
        self.check_available()?;
        let table = self.table(source_id).await;
        let mut articles: Vec<_> = table.articles.values().cloned().collect();
        articles.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.canonical_url.cmp(&b.canonical_url))
        });
        Ok(articles)
    }

    async fn commit_batch(
        &self,
        source_id: &str,
        writes: &[ArticleWrite],
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        self.check_available()?;
        let _guard = self.lock_source(source_id).await;

        let mut next = (*self.table(source_id).await).clone();
        let outcomes = writes
            .iter()
            .map(|write| next.apply(source_id, write))
            .collect::<Vec<_>>();

        self.tables
            .write()
            .await
            .insert(source_id.to_string(), Arc::new(next));
        Ok(outcomes)
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.runs
            .write()
            .await
            .entry(record.source_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_runs(&self, source_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        self.check_available()?;
        let runs = self.runs.read().await;
        Ok(runs
            .get(source_id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
