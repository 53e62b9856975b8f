//! Dedup Engine: exact fingerprint, then same-URL update, then new.

use chrono::{DateTime, Utc};
use newsagg_core::{article_id_for, CanonicalArticle};
use newsagg_storage::{ArticleRevision, ArticleWrite, SnapshotEntry, SourceSnapshot};
use strsim::jaro_winkler;
use tracing::info;
use uuid::Uuid;

use crate::normalize::{NormalizedCandidate, Rejection};

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Title similarity above which a new article is flagged as a likely near-duplicate.
    pub near_duplicate_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearDuplicate {
    pub id: Uuid,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    New {
        article: CanonicalArticle,
        near_duplicate_of: Option<NearDuplicate>,
    },
    Update {
        revision: ArticleRevision,
        previous_fingerprint: String,
    },
    DuplicateExact {
        id: Uuid,
        seen_at: DateTime<Utc>,
    },
    Rejected(Rejection),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::New { .. } => "new",
            Self::Update { .. } => "update",
            Self::DuplicateExact { .. } => "duplicate_exact",
            Self::Rejected(_) => "rejected",
        }
    }

    pub fn to_write(&self) -> Option<ArticleWrite> {
        match self {
            Self::New { article, .. } => Some(ArticleWrite::Insert(article.clone())),
            Self::Update { revision, .. } => Some(ArticleWrite::Revise(revision.clone())),
            Self::DuplicateExact { id, seen_at } => Some(ArticleWrite::Touch {
                id: *id,
                seen_at: *seen_at,
            }),
            Self::Rejected(_) => None,
        }
    }
}

fn title_key(title: &str) -> String {
    title.to_lowercase()
}

fn near_duplicate(candidate: &NormalizedCandidate, snapshot: &SourceSnapshot, threshold: f64) -> Option<NearDuplicate> {
    let key = title_key(&candidate.title);
    snapshot
        .entries()
        .map(|entry| NearDuplicate {
            id: entry.id,
            score: jaro_winkler(&key, &title_key(&entry.title)),
        })
        .filter(|hint| hint.score >= threshold)
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

/// Classify one candidate against a snapshot. No I/O, no mutation.
pub fn decide(candidate: &NormalizedCandidate, snapshot: &SourceSnapshot, config: &DedupConfig) -> Decision {
    if candidate.source_id != snapshot.source_id() {
        return Decision::Rejected(Rejection::SourceMismatch {
            expected: snapshot.source_id().to_string(),
            found: candidate.source_id.clone(),
        });
    }

    if let Some(existing) = snapshot.by_fingerprint(&candidate.fingerprint) {
        return Decision::DuplicateExact {
            id: existing.id,
            seen_at: candidate.fetched_at,
        };
    }

    if let Some(existing) = snapshot.by_url(&candidate.canonical_url) {
        return Decision::Update {
            revision: ArticleRevision {
                id: existing.id,
                title: candidate.title.clone(),
                excerpt: candidate.excerpt.clone(),
                fingerprint: candidate.fingerprint.clone(),
                keywords: candidate.keywords.clone(),
                media_urls: candidate.media_urls.clone(),
                published_at: candidate.published_at,
                published_at_estimated: candidate.published_at_estimated,
                seen_at: candidate.fetched_at,
            },
            previous_fingerprint: existing.fingerprint.clone(),
        };
    }

    Decision::New {
        article: CanonicalArticle {
            id: article_id_for(&candidate.source_id, &candidate.canonical_url),
            source_id: candidate.source_id.clone(),
            canonical_url: candidate.canonical_url.clone(),
            title: candidate.title.clone(),
            excerpt: candidate.excerpt.clone(),
            fingerprint: candidate.fingerprint.clone(),
            keywords: candidate.keywords.clone(),
            media_urls: candidate.media_urls.clone(),
            published_at: candidate.published_at,
            published_at_estimated: candidate.published_at_estimated,
            first_seen_at: candidate.fetched_at,
            last_seen_at: candidate.fetched_at,
            version: 1,
        },
        near_duplicate_of: near_duplicate(candidate, snapshot, config.near_duplicate_threshold),
    }
}

/// Per-run engine over a working copy of the run-start snapshot.
pub struct DedupEngine {
    config: DedupConfig,
    snapshot: SourceSnapshot,
}

impl DedupEngine {
    pub fn new(snapshot: SourceSnapshot, config: DedupConfig) -> Self {
        Self { config, snapshot }
    }

    pub fn snapshot(&self) -> &SourceSnapshot {
        &self.snapshot
    }

    /// Decide and fold the decision into the working snapshot so later candidates see it.
    pub fn process(&mut self, candidate: Result<NormalizedCandidate, Rejection>) -> Decision {
        let candidate = match candidate {
            Ok(candidate) => candidate,
            Err(rejection) => return Decision::Rejected(rejection),
        };
        let decision = decide(&candidate, &self.snapshot, &self.config);
        self.absorb(&decision);
        decision
    }

    fn absorb(&mut self, decision: &Decision) {
        match decision {
            Decision::New {
                article,
                near_duplicate_of,
            } => {
                if let Some(hint) = near_duplicate_of {
                    info!(
                        source_id = %article.source_id,
                        url = %article.canonical_url,
                        similar_to = %hint.id,
                        score = hint.score,
                        "near-duplicate title; keeping as distinct article"
                    );
                }
                self.snapshot.upsert(SnapshotEntry::from(article));
            }
            Decision::Update { revision, .. } => {
                let Some(existing) = self.snapshot.entries().find(|e| e.id == revision.id).cloned() else {
                    return;
                };
                self.snapshot.upsert(SnapshotEntry {
                    fingerprint: revision.fingerprint.clone(),
                    title: revision.title.clone(),
                    version: existing.version + 1,
                    ..existing
                });
            }
            Decision::DuplicateExact { .. } | Decision::Rejected(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::normalize::fingerprint;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).single().unwrap()
    }

    fn candidate(source: &str, url: &str, title: &str, body: &str) -> NormalizedCandidate {
        NormalizedCandidate {
            source_id: source.into(),
            canonical_url: url.into(),
            title: title.into(),
            body: body.into(),
            excerpt: body.into(),
            fingerprint: fingerprint(title, body),
            keywords: vec![],
            media_urls: vec![],
            published_at: at(9),
            published_at_estimated: false,
            fetched_at: at(10),
        }
    }

    fn entry(c: &NormalizedCandidate) -> SnapshotEntry {
        SnapshotEntry {
            id: article_id_for(&c.source_id, &c.canonical_url),
            canonical_url: c.canonical_url.clone(),
            fingerprint: c.fingerprint.clone(),
            title: c.title.clone(),
            version: 1,
        }
    }

    #[test]
    fn cascade_order_exact_then_url_then_new() {
        let stored = candidate("s1", "https://a/1", "Budget vote", "Deputies vote today.");
        let snapshot = SourceSnapshot::from_entries("s1", [entry(&stored)]);
        let config = DedupConfig::default();

        let same = candidate("s1", "https://a/1", "Budget vote", "Deputies vote today.");
        assert!(matches!(decide(&same, &snapshot, &config), Decision::DuplicateExact { id, .. } if id == entry(&stored).id));

        // Same content at a different URL is still an exact duplicate of the stored record.
        let mirrored = candidate("s1", "https://a/1-amp", "Budget vote", "Deputies vote today.");
        assert!(matches!(decide(&mirrored, &snapshot, &config), Decision::DuplicateExact { .. }));

        let edited = candidate("s1", "https://a/1", "Budget vote", "Deputies postponed the vote.");
        match decide(&edited, &snapshot, &config) {
            Decision::Update { revision, previous_fingerprint } => {
                assert_eq!(revision.id, entry(&stored).id);
                assert_eq!(revision.fingerprint, edited.fingerprint);
                assert_eq!(previous_fingerprint, stored.fingerprint);
            }
            other => panic!("expected update, got {other:?}"),
        }

        let fresh = candidate("s1", "https://a/2", "Port reopens", "Ships are moving again.");
        assert!(matches!(decide(&fresh, &snapshot, &config), Decision::New { near_duplicate_of: None, .. }));
    }

    #[test]
    fn other_source_snapshot_is_rejected() {
        let snapshot = SourceSnapshot::empty("s2");
        let c = candidate("s1", "https://a/1", "T", "B");
        assert!(matches!(
            decide(&c, &snapshot, &DedupConfig::default()),
            Decision::Rejected(Rejection::SourceMismatch { .. })
        ));
    }

    #[test]
    fn near_duplicate_titles_are_hinted_not_merged() {
        let stored = candidate("s1", "https://a/1", "Summit opens in Geneva", "Day one.");
        let snapshot = SourceSnapshot::from_entries("s1", [entry(&stored)]);
        let similar = candidate("s1", "https://a/2", "Summit opens in Geneva!", "Different body.");
        match decide(&similar, &snapshot, &DedupConfig::default()) {
            Decision::New { near_duplicate_of: Some(hint), article } => {
                assert_eq!(hint.id, entry(&stored).id);
                assert!(hint.score >= 0.95);
                assert_ne!(article.id, hint.id);
            }
            other => panic!("expected new with hint, got {other:?}"),
        }
    }

    #[test]
    fn engine_absorbs_decisions_within_a_run() {
        let mut engine = DedupEngine::new(SourceSnapshot::empty("s1"), DedupConfig::default());
        let first = engine.process(Ok(candidate("s1", "https://a/1", "T", "B")));
        assert_eq!(first.label(), "new");

        let repeat = engine.process(Ok(candidate("s1", "https://a/1?x", "T", "B")));
        assert_eq!(repeat.label(), "duplicate_exact");

        let changed = engine.process(Ok(candidate("s1", "https://a/1", "T", "B2")));
        assert_eq!(changed.label(), "update");
        let stored = engine.snapshot().by_url("https://a/1").unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.fingerprint, fingerprint("T", "B2"));
        assert!(engine.snapshot().by_fingerprint(&fingerprint("T", "B")).is_none());

        let rejected = engine.process(Err(Rejection::EmptyTitle));
        assert!(rejected.to_write().is_none());
        assert_eq!(engine.snapshot().len(), 1);
    }

    #[test]
    fn decisions_map_to_store_writes() {
        let mut engine = DedupEngine::new(SourceSnapshot::empty("s1"), DedupConfig::default());
        let new = engine.process(Ok(candidate("s1", "https://a/1", "T", "B")));
        assert!(matches!(new.to_write(), Some(ArticleWrite::Insert(ref a)) if a.version == 1 && a.first_seen_at == at(10)));
        let dup = engine.process(Ok(candidate("s1", "https://a/1", "T", "B")));
        assert!(matches!(dup.to_write(), Some(ArticleWrite::Touch { seen_at, .. }) if seen_at == at(10)));
    }
}
