//! Ingestion orchestration: normalizer, dedup engine, run coordinator and scheduler.

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod normalize;
pub mod scheduler;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use newsagg_adapters::adapter_for_source;
use newsagg_core::{RunRecord, SourceConfig};
use newsagg_storage::{ArticleStore, ArticleView, HttpFetcher, MemoryStore, PgStore, StoreGateway};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use config::{check_source, PipelineConfig, SourceRegistry};
pub use coordinator::{RunCoordinator, RunFailure, RunPhase, DEFAULT_RUN_TIMEOUT};
pub use dedup::{decide, Decision, DedupConfig, DedupEngine, NearDuplicate};
pub use normalize::{canonicalize_url, fingerprint, normalize, NormalizedCandidate, Rejection};
pub use scheduler::{ScheduleError, Scheduler, SourceRunState, TriggerError, MIN_INTERVAL};
pub use telemetry::{
    FanoutTelemetry, JsonLinesTelemetry, MemoryTelemetry, TelemetryEvent, TelemetrySink, TracingTelemetry,
};

pub const CRATE_NAME: &str = "newsagg-sync";

const TELEMETRY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fully wired pipeline: store, fetcher, telemetry, coordinator and a scheduler with every valid source.
pub struct IngestPipeline {
    pub config: PipelineConfig,
    pub registry: SourceRegistry,
    gateway: Arc<StoreGateway>,
    scheduler: Scheduler,
    telemetry_writer: Option<JoinHandle<()>>,
}

impl IngestPipeline {
    pub async fn from_env() -> Result<Self> {
        Self::build(PipelineConfig::from_env()).await
    }

    pub async fn build(config: PipelineConfig) -> Result<Self> {
        let store: Arc<dyn ArticleStore> = match config.database_url.as_deref() {
            Some(url) => {
                let store = PgStore::connect(url).await.context("connecting to postgres")?;
                store.ensure_schema().await.context("preparing article schema")?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; articles are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        let gateway = Arc::new(StoreGateway::new(store, config.cache_ttl));
        let fetcher = Arc::new(HttpFetcher::new(config.http_config()).context("building http client")?);

        let mut sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(TracingTelemetry)];
        let mut telemetry_writer = None;
        if let Some(dir) = config.telemetry_dir.as_deref() {
            let (sink, writer) = JsonLinesTelemetry::spawn(dir).await?;
            sinks.push(Arc::new(sink));
            telemetry_writer = Some(writer);
        }
        let telemetry: Arc<dyn TelemetrySink> = Arc::new(FanoutTelemetry::new(sinks));

        let coordinator =
            Arc::new(RunCoordinator::new(gateway.clone(), telemetry.clone()).with_run_timeout(config.run_timeout));
        let scheduler = Scheduler::new(coordinator, telemetry, config.max_concurrent_runs);

        let registry = SourceRegistry::load(&config.sources_path).await?;
        let mut excluded = registry.rejected.len();
        for source in &registry.sources {
            if let Err(err) = register_source(&scheduler, source, fetcher.clone()).await {
                warn!(source_id = %source.source_id, error = %err, "source not scheduled");
                excluded += 1;
            }
        }
        info!(
            backend = gateway.backend_name(),
            scheduled = scheduler.sources().len(),
            excluded,
            "pipeline ready"
        );

        Ok(Self {
            config,
            registry,
            gateway,
            scheduler,
            telemetry_writer,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn gateway(&self) -> &Arc<StoreGateway> {
        &self.gateway
    }

    /// Arm the timers; with `run_on_start` every enabled source is also triggered once.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.context("starting scheduler")?;
        if self.config.run_on_start {
            for source in self.scheduler.sources() {
                if let Err(err) = self.scheduler.trigger_scheduled(&source.source_id) {
                    warn!(source_id = %source.source_id, error = %err, "initial run not started");
                }
            }
        }
        Ok(())
    }

    pub async fn run_source(&self, source_id: &str) -> Result<RunRecord> {
        let handle = self.scheduler.force_run(source_id)?;
        handle.await.context("run task failed")
    }

    /// Force one run of every enabled source, bounded by the global run limit.
    pub async fn run_all(&self) -> Vec<RunRecord> {
        let mut handles = Vec::new();
        for source in self.scheduler.sources().into_iter().filter(|s| s.enabled) {
            match self.scheduler.force_run(&source.source_id) {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(source_id = %source.source_id, error = %err, "run not started"),
            }
        }
        join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok())
            .collect()
    }

    pub async fn articles(&self, source_id: &str) -> Result<ArticleView> {
        Ok(self.gateway.articles(source_id).await?)
    }

    pub async fn runs(&self, source_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(self.gateway.runs(source_id, limit).await?)
    }

    /// Stop timers, let in-flight runs finish, then drain the telemetry writer.
    pub async fn shutdown(self) {
        let Self {
            scheduler,
            telemetry_writer,
            ..
        } = self;
        scheduler.shutdown().await;
        drop(scheduler);
        if let Some(writer) = telemetry_writer {
            if tokio::time::timeout(TELEMETRY_DRAIN_TIMEOUT, writer).await.is_err() {
                warn!("telemetry writer did not drain in time");
            }
        }
    }
}

async fn register_source(scheduler: &Scheduler, source: &SourceConfig, fetcher: Arc<HttpFetcher>) -> Result<()> {
    let adapter = adapter_for_source(source, fetcher)?;
    scheduler.register(source.clone(), adapter).await?;
    Ok(())
}
