//! Run Coordinator: one ingestion run for one source, from listing to terminal RunRecord.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use newsagg_adapters::{AdapterContext, SourceAdapter};
use newsagg_core::{
    CandidateErrorKind, CandidateRejection, RunCounts, RunOutcome, RunRecord, SourceConfig, TriggerKind,
};
use newsagg_storage::{StoreError, StoreGateway, WriteOutcome};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{Decision, DedupConfig, DedupEngine};
use crate::normalize::{canonicalize_url, normalize};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Fetching,
    Processing,
    Committing,
    Finished(RunOutcome),
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished(_))
    }

    /// Forward edges only; any non-terminal phase may fail.
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Finished(_), _) => false,
            (_, Finished(RunOutcome::Failed)) => true,
            (Pending, Fetching) | (Fetching, Processing) | (Processing, Committing) => true,
            (Committing, Finished(_)) => true,
            _ => false,
        }
    }
}

/// Unrecoverable run-level failures.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error("listing fetch failed: {0}")]
    Listing(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run exceeded its {0:?} timeout")]
    TimedOut(Duration),
}

/// In-memory state of one run; only its terminal form is persisted.
struct RunTally {
    run_id: Uuid,
    source_id: String,
    trigger: TriggerKind,
    started_at: DateTime<Utc>,
    phase: RunPhase,
    counts: RunCounts,
    rejections: Vec<CandidateRejection>,
    listing_errors: Vec<String>,
    decisions: Vec<(String, Decision)>,
}

impl RunTally {
    fn new(run_id: Uuid, source_id: &str, trigger: TriggerKind) -> Self {
        Self {
            run_id,
            source_id: source_id.to_string(),
            trigger,
            started_at: Utc::now(),
            phase: RunPhase::Pending,
            counts: RunCounts::default(),
            rejections: Vec::new(),
            listing_errors: Vec::new(),
            decisions: Vec::new(),
        }
    }

    fn enter(&mut self, next: RunPhase) {
        debug_assert!(!self.phase.is_terminal(), "run already finished");
        debug_assert!(self.phase.can_transition_to(next), "{:?} -> {next:?}", self.phase);
        debug!(run_id = %self.run_id, from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
    }

    fn reject(&mut self, url: &str, kind: CandidateErrorKind, message: String) {
        debug!(run_id = %self.run_id, url, ?kind, %message, "candidate rejected");
        self.counts.rejected += 1;
        self.rejections.push(CandidateRejection {
            url: url.to_string(),
            kind,
            message,
        });
    }

    fn apply_commit(&mut self, decisions: &[(String, Decision)], outcomes: Vec<WriteOutcome>) {
        for ((url, decision), outcome) in decisions.iter().zip(outcomes) {
            match outcome {
                WriteOutcome::Applied => match decision {
                    Decision::New { .. } => self.counts.new += 1,
                    Decision::Update { .. } => self.counts.updated += 1,
                    Decision::DuplicateExact { .. } => self.counts.duplicate += 1,
                    Decision::Rejected(_) => {}
                },
                WriteOutcome::Conflict(message) => {
                    self.reject(url, CandidateErrorKind::CommitConflict, message)
                }
            }
        }
    }

    fn outcome(&self, failure: Option<&RunFailure>) -> RunOutcome {
        if failure.is_some() {
            return RunOutcome::Failed;
        }
        let degraded = self.counts.rejected > 0 || !self.listing_errors.is_empty();
        if !degraded {
            RunOutcome::Succeeded
        } else if self.counts.committed() > 0 || self.counts.rejected == 0 {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Failed
        }
    }

    fn error_summary(&self, failure: Option<&RunFailure>) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(failure) = failure {
            parts.push(failure.to_string());
        }
        if self.counts.rejected > 0 {
            parts.push(format!("{} candidate(s) rejected", self.counts.rejected));
        }
        for listing in &self.listing_errors {
            parts.push(format!("listing page failed: {listing}"));
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }

    fn finish(mut self, failure: Option<RunFailure>) -> RunRecord {
        let outcome = self.outcome(failure.as_ref());
        let error_summary = self.error_summary(failure.as_ref());
        self.enter(RunPhase::Finished(outcome));
        RunRecord {
            run_id: self.run_id,
            source_id: self.source_id,
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            counts: self.counts,
            error_summary,
            rejections: self.rejections,
        }
    }
}

pub struct RunCoordinator {
    gateway: Arc<StoreGateway>,
    telemetry: Arc<dyn TelemetrySink>,
    dedup: DedupConfig,
    run_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl RunCoordinator {
    pub fn new(gateway: Arc<StoreGateway>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            gateway,
            telemetry,
            dedup: DedupConfig::default(),
            run_timeout: DEFAULT_RUN_TIMEOUT,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_dedup_config(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    /// Flag that asks in-flight runs to stop fetching and wrap up.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn gateway(&self) -> &Arc<StoreGateway> {
        &self.gateway
    }

    /// Execute one run against an immutable config snapshot. Always returns a terminal record,
    /// which has already been persisted and emitted.
    pub async fn run_once(
        &self,
        source: Arc<SourceConfig>,
        adapter: Arc<dyn SourceAdapter>,
        trigger: TriggerKind,
    ) -> RunRecord {
        self.run_with_id(Uuid::new_v4(), source, adapter, trigger).await
    }

    /// Same as [`run_once`](Self::run_once) with a caller-assigned run id.
    pub async fn run_with_id(
        &self,
        run_id: Uuid,
        source: Arc<SourceConfig>,
        adapter: Arc<dyn SourceAdapter>,
        trigger: TriggerKind,
    ) -> RunRecord {
        let span = info_span!("ingest_run", %run_id, source_id = %source.source_id, trigger = trigger.as_str());
        async move {
            let mut tally = RunTally::new(run_id, &source.source_id, trigger);
            let ctx = AdapterContext::new(run_id, self.stop.clone());
            let failure = self.drive(&source, adapter.as_ref(), &ctx, &mut tally).await.err();
            let record = tally.finish(failure);
            self.publish(&record).await;
            record
        }
        .instrument(span)
        .await
    }

    /// Record a run that never produced its own record (the coordinator task died).
    pub async fn record_abandoned(
        &self,
        run_id: Uuid,
        source_id: &str,
        trigger: TriggerKind,
        started_at: DateTime<Utc>,
        reason: &str,
    ) -> RunRecord {
        let record = RunRecord {
            run_id,
            source_id: source_id.to_string(),
            trigger,
            started_at,
            finished_at: Utc::now(),
            outcome: RunOutcome::Failed,
            counts: RunCounts::default(),
            error_summary: Some(reason.to_string()),
            rejections: Vec::new(),
        };
        self.publish(&record).await;
        record
    }

    async fn publish(&self, record: &RunRecord) {
        if let Err(err) = self.gateway.record_run(record).await {
            error!(run_id = %record.run_id, error = %err, "failed to persist run record");
        }
        self.telemetry.emit(TelemetryEvent::RunFinished(record.clone()));
    }

    async fn drive(
        &self,
        source: &SourceConfig,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
        tally: &mut RunTally,
    ) -> Result<(), RunFailure> {
        let deadline = Instant::now() + self.run_timeout;
        let timed_out = |tally: &mut RunTally| {
            warn!(timeout = ?self.run_timeout, phase = ?tally.phase, "run timed out; outstanding work abandoned");
            tally.decisions.clear();
            RunFailure::TimedOut(self.run_timeout)
        };

        tally.enter(RunPhase::Fetching);
        let snapshot = match timeout_at(deadline, self.gateway.read_snapshot(&source.source_id)).await {
            Ok(snapshot) => snapshot?,
            Err(_) => return Err(timed_out(tally)),
        };
        let mut engine = DedupEngine::new(snapshot, self.dedup);

        match timeout_at(deadline, self.collect(source, adapter, ctx, tally, &mut engine)).await {
            Ok(result) => result?,
            Err(_) => return Err(timed_out(tally)),
        }

        // A dropped commit rolls back as a whole.
        tally.enter(RunPhase::Committing);
        let decisions = std::mem::take(&mut tally.decisions);
        match timeout_at(deadline, self.commit(&source.source_id, decisions)).await {
            Ok(result) => {
                let (outcomes, decisions) = result?;
                tally.apply_commit(&decisions, outcomes);
                Ok(())
            }
            Err(_) => Err(timed_out(tally)),
        }
    }

    async fn collect(
        &self,
        source: &SourceConfig,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
        tally: &mut RunTally,
        engine: &mut DedupEngine,
    ) -> Result<(), RunFailure> {
        let mut urls = Vec::new();
        let mut seen = HashSet::new();
        {
            let mut listing = adapter.fetch_listing(source, ctx);
            while let Some(item) = listing.next().await {
                match item {
                    Ok(url) => {
                        // Listing entries that reduce to one article are fetched once.
                        let key = canonicalize_url(&url, &source.base_url, &source.keep_query_params)
                            .unwrap_or_else(|_| url.clone());
                        if seen.insert(key) {
                            urls.push(url);
                        } else {
                            debug!(url = %url, "listing entry repeats a canonical url");
                        }
                    }
                    Err(err) => tally.listing_errors.push(err.to_string()),
                }
            }
        }
        tally.counts.discovered = urls.len() as u32;
        if urls.is_empty() {
            if let Some(first) = tally.listing_errors.first().cloned() {
                tally.listing_errors.clear();
                return Err(RunFailure::Listing(first));
            }
        }
        info!(discovered = urls.len(), listing_errors = tally.listing_errors.len(), "listing complete");

        tally.enter(RunPhase::Processing);
        let mut decided = HashSet::new();
        for (index, url) in urls.iter().enumerate() {
            if ctx.is_stopping() {
                let remaining = (urls.len() - index) as u32;
                info!(skipped = remaining, "stop requested; remaining candidates skipped");
                tally.counts.skipped += remaining;
                break;
            }
            let raw = match adapter.fetch_article(source, url, ctx).await {
                Ok(raw) => raw,
                Err(err) => {
                    tally.reject(url, err.kind(), err.to_string());
                    continue;
                }
            };
            tally.counts.fetched += 1;
            let candidate = normalize(&raw, source);
            if let Ok(candidate) = &candidate {
                if !decided.insert(candidate.canonical_url.clone()) {
                    debug!(url = %url, canonical_url = %candidate.canonical_url, "article already decided in this run");
                    tally.counts.duplicate += 1;
                    continue;
                }
            }
            match engine.process(candidate) {
                Decision::Rejected(rejection) => tally.reject(url, rejection.kind(), rejection.to_string()),
                decision => {
                    debug!(url = %url, decision = decision.label(), "candidate decided");
                    tally.decisions.push((url.clone(), decision));
                }
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        source_id: &str,
        decisions: Vec<(String, Decision)>,
    ) -> Result<(Vec<WriteOutcome>, Vec<(String, Decision)>), RunFailure> {
        let writes: Vec<_> = decisions.iter().filter_map(|(_, d)| d.to_write()).collect();
        let outcomes = self.gateway.commit_batch(source_id, &writes).await?;
        for (write, outcome) in writes.iter().zip(&outcomes) {
            if let WriteOutcome::Conflict(message) = outcome {
                warn!(article_id = %write.article_id(), %message, "write conflicted with a concurrent change");
            }
        }
        Ok((outcomes, decisions))
    }

}
