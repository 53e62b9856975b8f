//! Postgres-backed store. Each commit is one transaction holding a per-source advisory lock.

use std::time::Duration;

use async_trait::async_trait;
use newsagg_core::{CandidateRejection, CanonicalArticle, RunCounts, RunOutcome, RunRecord, TriggerKind};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::store::{ArticleStore, ArticleWrite, SnapshotEntry, StoreError, WriteOutcome};

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create tables if absent. Schema evolution is handled outside the pipeline.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        info!("news_articles / ingest_runs schema ensured");
        Ok(())
    }
}

fn article_from_row(row: &PgRow) -> Result<CanonicalArticle, StoreError> {
    let version: i32 = row.try_get("version")?;
    Ok(CanonicalArticle {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        canonical_url: row.try_get("canonical_url")?,
        title: row.try_get("title")?,
        excerpt: row.try_get("excerpt")?,
        fingerprint: row.try_get("fingerprint")?,
        keywords: row.try_get("keywords")?,
        media_urls: row.try_get("media_urls")?,
        published_at: row.try_get("published_at")?,
        published_at_estimated: row.try_get("published_at_estimated")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        version: u32::try_from(version).map_err(|_| StoreError::Corrupt(format!("negative version {version}")))?,
    })
}

fn count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative")))
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let outcome: String = row.try_get("outcome")?;
    let trigger: String = row.try_get("trigger_kind")?;
    let rejections: Json<Vec<CandidateRejection>> = row.try_get("rejections")?;
    Ok(RunRecord {
        run_id: row.try_get("run_id")?,
        source_id: row.try_get("source_id")?,
        trigger: match trigger.as_str() {
            "forced" => TriggerKind::Forced,
            _ => TriggerKind::Scheduled,
        },
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        outcome: outcome.parse::<RunOutcome>().map_err(StoreError::Corrupt)?,
        counts: RunCounts {
            discovered: count(row, "discovered")?,
            fetched: count(row, "fetched")?,
            new: count(row, "new_count")?,
            updated: count(row, "updated_count")?,
            duplicate: count(row, "duplicate_count")?,
            rejected: count(row, "rejected_count")?,
            skipped: count(row, "skipped_count")?,
        },
        error_summary: row.try_get("error_summary")?,
        rejections: rejections.0,
    })
}

fn as_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn conflict_or_applied(rows_affected: u64, reason: impl FnOnce() -> String) -> WriteOutcome {
    if rows_affected == 1 {
        WriteOutcome::Applied
    } else {
        WriteOutcome::Conflict(reason())
    }
}

#[async_trait]
impl ArticleStore for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn load_articles(&self, source_id: &str) -> Result<Vec<CanonicalArticle>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source_id, canonical_url, title, excerpt, fingerprint, keywords, media_urls, \
             published_at, published_at_estimated, first_seen_at, last_seen_at, version \
             FROM news_articles WHERE source_id = $1 \
             ORDER BY published_at DESC, canonical_url ASC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn snapshot_entries(&self, source_id: &str) -> Result<Vec<SnapshotEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, canonical_url, fingerprint, title, version FROM news_articles WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SnapshotEntry {
                    id: row.try_get::<Uuid, _>("id")?,
                    canonical_url: row.try_get("canonical_url")?,
                    fingerprint: row.try_get("fingerprint")?,
                    title: row.try_get("title")?,
                    version: count(row, "version")?,
                })
            })
            .collect()
    }

    async fn commit_batch(
        &self,
        source_id: &str,
        writes: &[ArticleWrite],
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        let mut outcomes = Vec::with_capacity(writes.len());
        for write in writes {
            let outcome = match write {
                ArticleWrite::Insert(article) if article.source_id != source_id => WriteOutcome::Conflict(
                    format!("article belongs to {} not {source_id}", article.source_id),
                ),
                ArticleWrite::Insert(article) => {
                    let result = sqlx::query(
                        "INSERT INTO news_articles (id, source_id, canonical_url, title, excerpt, fingerprint, \
                         keywords, media_urls, published_at, published_at_estimated, first_seen_at, last_seen_at, version) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                         ON CONFLICT DO NOTHING",
                    )
                    .bind(article.id)
                    .bind(&article.source_id)
                    .bind(&article.canonical_url)
                    .bind(&article.title)
                    .bind(&article.excerpt)
                    .bind(&article.fingerprint)
                    .bind(&article.keywords)
                    .bind(&article.media_urls)
                    .bind(article.published_at)
                    .bind(article.published_at_estimated)
                    .bind(article.first_seen_at)
                    .bind(article.last_seen_at)
                    .bind(as_i32(article.version))
                    .execute(&mut *tx)
                    .await?;
                    conflict_or_applied(result.rows_affected(), || {
                        format!("article {} collides on id, url or fingerprint", article.id)
                    })
                }
                ArticleWrite::Revise(revision) => {
                    let result = sqlx::query(
                        "UPDATE news_articles SET title = $3, excerpt = $4, fingerprint = $5, keywords = $6, \
                         media_urls = $7, published_at = $8, published_at_estimated = $9, \
                         last_seen_at = GREATEST(last_seen_at, $10), version = version + 1 \
                         WHERE id = $1 AND source_id = $2 \
                         AND NOT EXISTS (SELECT 1 FROM news_articles o \
                             WHERE o.source_id = $2 AND o.fingerprint = $5 AND o.id <> $1)",
                    )
                    .bind(revision.id)
                    .bind(source_id)
                    .bind(&revision.title)
                    .bind(&revision.excerpt)
                    .bind(&revision.fingerprint)
                    .bind(&revision.keywords)
                    .bind(&revision.media_urls)
                    .bind(revision.published_at)
                    .bind(revision.published_at_estimated)
                    .bind(revision.seen_at)
                    .execute(&mut *tx)
                    .await?;
                    conflict_or_applied(result.rows_affected(), || {
                        format!("article {} missing or fingerprint taken", revision.id)
                    })
                }
                ArticleWrite::Touch { id, seen_at } => {
                    let result = sqlx::query(
                        "UPDATE news_articles SET last_seen_at = GREATEST(last_seen_at, $3) \
                         WHERE id = $1 AND source_id = $2",
                    )
                    .bind(id)
                    .bind(source_id)
                    .bind(seen_at)
                    .execute(&mut *tx)
                    .await?;
                    conflict_or_applied(result.rows_affected(), || format!("article {id} not found"))
                }
            };
            outcomes.push(outcome);
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ingest_runs (run_id, source_id, trigger_kind, started_at, finished_at, outcome, \
             discovered, fetched, new_count, updated_count, duplicate_count, rejected_count, skipped_count, \
             error_summary, rejections) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(record.run_id)
        .bind(&record.source_id)
        .bind(record.trigger.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.outcome.as_str())
        .bind(as_i32(record.counts.discovered))
        .bind(as_i32(record.counts.fetched))
        .bind(as_i32(record.counts.new))
        .bind(as_i32(record.counts.updated))
        .bind(as_i32(record.counts.duplicate))
        .bind(as_i32(record.counts.rejected))
        .bind(as_i32(record.counts.skipped))
        .bind(record.error_summary.as_deref())
        .bind(Json(&record.rejections))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, source_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, source_id, trigger_kind, started_at, finished_at, outcome, discovered, fetched, \
             new_count, updated_count, duplicate_count, rejected_count, skipped_count, error_summary, rejections \
             FROM ingest_runs WHERE source_id = $1 ORDER BY started_at DESC LIMIT $2",
        )
        .bind(source_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}
