//! Read-through cache of per-source article views.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use newsagg_core::CanonicalArticle;
use tokio::sync::Mutex;

pub type ArticleView = Arc<Vec<CanonicalArticle>>;

#[derive(Debug, Default)]
struct SourceSlot {
    /// Bumped on every invalidation; loads started under an older generation are discarded.
    generation: u64,
    view: Option<(ArticleView, Instant)>,
}

#[derive(Debug)]
pub struct ReadCache {
    ttl: Option<Duration>,
    slots: Mutex<HashMap<String, SourceSlot>>,
}

impl ReadCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cached view if present and fresh, plus the generation a miss should load under.
    pub async fn lookup(&self, source_id: &str) -> Result<ArticleView, u64> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(source_id.to_string()).or_default();
        match &slot.view {
            Some((view, cached_at)) if self.is_fresh(*cached_at) => Ok(view.clone()),
            _ => {
                slot.view = None;
                Err(slot.generation)
            }
        }
    }

    /// Store a freshly loaded view unless the source was invalidated since `generation`.
    pub async fn fill(&self, source_id: &str, generation: u64, view: ArticleView) -> bool {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(source_id.to_string()).or_default();
        if slot.generation != generation {
            return false;
        }
        slot.view = Some((view, Instant::now()));
        true
    }

    pub async fn invalidate(&self, source_id: &str) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(source_id.to_string()).or_default();
        slot.generation += 1;
        slot.view = None;
    }

    fn is_fresh(&self, cached_at: Instant) -> bool {
        self.ttl.map_or(true, |ttl| cached_at.elapsed() < ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fill_then_hit() {
        let cache = ReadCache::new(None);
        let generation = cache.lookup("s1").await.unwrap_err();
        assert!(cache.fill("s1", generation, Arc::new(Vec::new())).await);
        assert!(cache.lookup("s1").await.is_ok());
    }

    #[tokio::test]
    async fn load_racing_an_invalidation_is_discarded() {
        let cache = ReadCache::new(None);
        let generation = cache.lookup("s1").await.unwrap_err();
        cache.invalidate("s1").await;
        assert!(!cache.fill("s1", generation, Arc::new(Vec::new())).await);
        assert!(cache.lookup("s1").await.is_err());
    }

    #[tokio::test]
    async fn invalidation_is_scoped_to_one_source() {
        let cache = ReadCache::new(None);
        for source in ["s1", "s2"] {
            let generation = cache.lookup(source).await.unwrap_err();
            cache.fill(source, generation, Arc::new(Vec::new())).await;
        }
        cache.invalidate("s1").await;
        assert!(cache.lookup("s1").await.is_err());
        assert!(cache.lookup("s2").await.is_ok());
    }

    #[tokio::test]
    async fn zero_ttl_never_hits() {
        let cache = ReadCache::new(Some(Duration::ZERO));
        let generation = cache.lookup("s1").await.unwrap_err();
        cache.fill("s1", generation, Arc::new(Vec::new())).await;
        assert!(cache.lookup("s1").await.is_err());
    }
}
