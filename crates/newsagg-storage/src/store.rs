//! Durable article store contract and the per-source snapshot used for dedup.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsagg_core::{CanonicalArticle, RunRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
                Self::Corrupt(err.to_string())
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Replacement content for an article whose URL now serves different content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRevision {
    pub id: Uuid,
    pub title: String,
    pub excerpt: String,
    pub fingerprint: String,
    pub keywords: Vec<String>,
    pub media_urls: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub published_at_estimated: bool,
    pub seen_at: DateTime<Utc>,
}

/// One resolved dedup decision, in the form the store applies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArticleWrite {
    Insert(CanonicalArticle),
    /// Replace content, bump version, refresh last-seen.
    Revise(ArticleRevision),
    /// Refresh last-seen only.
    Touch { id: Uuid, seen_at: DateTime<Utc> },
}

impl ArticleWrite {
    pub fn article_id(&self) -> Uuid {
        match self {
            Self::Insert(article) => article.id,
            Self::Revise(revision) => revision.id,
            Self::Touch { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    Applied,
    Conflict(String),
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// The parts of a stored article the dedup cascade looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: Uuid,
    pub canonical_url: String,
    pub fingerprint: String,
    pub title: String,
    pub version: u32,
}

impl From<&CanonicalArticle> for SnapshotEntry {
    fn from(article: &CanonicalArticle) -> Self {
        Self {
            id: article.id,
            canonical_url: article.canonical_url.clone(),
            fingerprint: article.fingerprint.clone(),
            title: article.title.clone(),
            version: article.version,
        }
    }
}

/// Fingerprint and URL indexes over one source's committed articles.
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    source_id: String,
    entries: HashMap<Uuid, SnapshotEntry>,
    by_fingerprint: HashMap<String, Uuid>,
    by_url: HashMap<String, Uuid>,
}

impl SourceSnapshot {
    pub fn empty(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn from_entries(source_id: impl Into<String>, entries: impl IntoIterator<Item = SnapshotEntry>) -> Self {
        let mut snapshot = Self::empty(source_id);
        for entry in entries {
            snapshot.upsert(entry);
        }
        snapshot
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<&SnapshotEntry> {
        self.by_fingerprint
            .get(fingerprint)
            .and_then(|id| self.entries.get(id))
    }

    pub fn by_url(&self, canonical_url: &str) -> Option<&SnapshotEntry> {
        self.by_url.get(canonical_url).and_then(|id| self.entries.get(id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    /// Insert or replace an entry, keeping both indexes consistent.
    pub fn upsert(&mut self, entry: SnapshotEntry) {
        if let Some(previous) = self.entries.remove(&entry.id) {
            if self.by_fingerprint.get(&previous.fingerprint) == Some(&previous.id) {
                self.by_fingerprint.remove(&previous.fingerprint);
            }
            if self.by_url.get(&previous.canonical_url) == Some(&previous.id) {
                self.by_url.remove(&previous.canonical_url);
            }
        }
        self.by_fingerprint.insert(entry.fingerprint.clone(), entry.id);
        self.by_url.insert(entry.canonical_url.clone(), entry.id);
        self.entries.insert(entry.id, entry);
    }
}

/// Storage backend behind the gateway. Commits must be atomic per source.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn load_articles(&self, source_id: &str) -> Result<Vec<CanonicalArticle>, StoreError>;

    async fn snapshot_entries(&self, source_id: &str) -> Result<Vec<SnapshotEntry>, StoreError> {
        Ok(self
            .load_articles(source_id)
            .await?
            .iter()
            .map(SnapshotEntry::from)
            .collect())
    }

    /// Apply all writes for one source as a single unit visible to readers all at once.
    async fn commit_batch(
        &self,
        source_id: &str,
        writes: &[ArticleWrite],
    ) -> Result<Vec<WriteOutcome>, StoreError>;

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn list_runs(&self, source_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}
