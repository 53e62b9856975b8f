//! Cache/Store gateway: the only owner of persisted articles and run records.

use std::sync::Arc;
use std::time::Duration;

use newsagg_core::RunRecord;
use tracing::{debug, info};

use crate::cache::{ArticleView, ReadCache};
use crate::store::{ArticleStore, ArticleWrite, SourceSnapshot, StoreError, WriteOutcome};

pub struct StoreGateway {
    store: Arc<dyn ArticleStore>,
    cache: ReadCache,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn ArticleStore>, cache_ttl: Option<Duration>) -> Self {
        Self {
            store,
            cache: ReadCache::new(cache_ttl),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Fingerprint/URL view of everything committed for `source_id` so far.
    pub async fn read_snapshot(&self, source_id: &str) -> Result<SourceSnapshot, StoreError> {
        let entries = self.store.snapshot_entries(source_id).await?;
        Ok(SourceSnapshot::from_entries(source_id, entries))
    }

    /// Commit one run's writes, then evict the source's cached view.
    pub async fn commit_batch(
        &self,
        source_id: &str,
        writes: &[ArticleWrite],
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        let outcomes = self.store.commit_batch(source_id, writes).await?;
        let applied = outcomes.iter().filter(|o| o.is_applied()).count();
        if applied > 0 {
            self.invalidate(source_id).await;
        }
        info!(source_id, writes = writes.len(), applied, "batch committed");
        Ok(outcomes)
    }

    pub async fn invalidate(&self, source_id: &str) {
        self.cache.invalidate(source_id).await;
        debug!(source_id, "read cache invalidated");
    }

    /// Read path for API consumers; served from cache when fresh.
    pub async fn articles(&self, source_id: &str) -> Result<ArticleView, StoreError> {
        let generation = match self.cache.lookup(source_id).await {
            Ok(view) => return Ok(view),
            Err(generation) => generation,
        };
        let view: ArticleView = Arc::new(self.store.load_articles(source_id).await?);
        self.cache.fill(source_id, generation, view.clone()).await;
        Ok(view)
    }

    pub async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.store.record_run(record).await
    }

    pub async fn runs(&self, source_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        self.store.list_runs(source_id, limit).await
    }
}
