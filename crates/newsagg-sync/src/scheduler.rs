//! Scheduler: per-source timers, one run in flight per source, FIFO admission under a global limit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use newsagg_adapters::SourceAdapter;
use newsagg_core::{ConfigError, FetchInterval, RunOutcome, RunRecord, SourceConfig, TriggerKind};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::check_source;
use crate::coordinator::RunCoordinator;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("source {source_id} already has run {run_id} in flight")]
    AlreadyRunning { source_id: String, run_id: Uuid },
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("source {source_id}: interval {interval} is below the one-minute minimum")]
    IntervalTooShort { source_id: String, interval: FetchInterval },
    #[error("source {source_id}: invalid cron expression: {message}")]
    Cron { source_id: String, message: String },
    #[error("source {0} is already registered")]
    Duplicate(String),
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("timer: {0}")]
    Timer(String),
}

/// Per-source scheduling state, mutated only by trigger and completion transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceRunState {
    pub enabled: bool,
    pub running: bool,
    pub current_run: Option<Uuid>,
    pub current_started_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<Uuid>,
    pub last_outcome: Option<RunOutcome>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub missed_triggers: u64,
    pub consecutive_failures: u32,
}

struct SourceEntry {
    config: Arc<SourceConfig>,
    adapter: Arc<dyn SourceAdapter>,
    state: SourceRunState,
    job_id: Option<Uuid>,
}

/// FIFO admission gate in front of the coordinator.
struct RunQueue {
    limit: usize,
    active: usize,
    waiting: VecDeque<oneshot::Sender<()>>,
}

struct Admitted {
    run_id: Uuid,
    config: Arc<SourceConfig>,
    adapter: Arc<dyn SourceAdapter>,
}

struct Inner {
    coordinator: Arc<RunCoordinator>,
    telemetry: Arc<dyn TelemetrySink>,
    sources: Mutex<HashMap<String, SourceEntry>>,
    queue: Mutex<RunQueue>,
    stop: Arc<AtomicBool>,
    in_flight: AtomicUsize,
    idle: Notify,
    timers: tokio::sync::Mutex<Option<JobScheduler>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(coordinator: Arc<RunCoordinator>, telemetry: Arc<dyn TelemetrySink>, max_concurrent_runs: usize) -> Self {
        let stop = coordinator.stop_flag();
        Self {
            inner: Arc::new(Inner {
                coordinator,
                telemetry,
                sources: Mutex::new(HashMap::new()),
                queue: Mutex::new(RunQueue {
                    limit: max_concurrent_runs.max(1),
                    active: 0,
                    waiting: VecDeque::new(),
                }),
                stop,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                timers: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.inner.coordinator
    }

    /// Add a source. Invalid config rejects only this source.
    pub async fn register(&self, config: SourceConfig, adapter: Arc<dyn SourceAdapter>) -> Result<(), ScheduleError> {
        validate_schedule(&config)?;
        let config = Arc::new(config);
        {
            let mut sources = lock(&self.inner.sources);
            if sources.contains_key(&config.source_id) {
                return Err(ScheduleError::Duplicate(config.source_id.clone()));
            }
            sources.insert(
                config.source_id.clone(),
                SourceEntry {
                    config: config.clone(),
                    adapter,
                    state: SourceRunState {
                        enabled: config.enabled,
                        ..Default::default()
                    },
                    job_id: None,
                },
            );
        }
        info!(source_id = %config.source_id, interval = %config.interval, cron = ?config.cron, "source registered");

        let timers = self.inner.timers.lock().await;
        if let Some(sched) = timers.as_ref() {
            self.add_timer(sched, &config).await?;
        }
        Ok(())
    }

    /// Replace a source's config and adapter. Runs already in flight keep their snapshot.
    pub async fn update_source(&self, config: SourceConfig, adapter: Arc<dyn SourceAdapter>) -> Result<(), ScheduleError> {
        validate_schedule(&config)?;
        let config = Arc::new(config);
        let old_job = {
            let mut sources = lock(&self.inner.sources);
            let entry = sources
                .get_mut(&config.source_id)
                .ok_or_else(|| ScheduleError::UnknownSource(config.source_id.clone()))?;
            entry.config = config.clone();
            entry.adapter = adapter;
            entry.state.enabled = config.enabled;
            entry.job_id.take()
        };
        info!(source_id = %config.source_id, "source config reloaded");

        let timers = self.inner.timers.lock().await;
        if let Some(sched) = timers.as_ref() {
            if let Some(job_id) = old_job {
                if let Err(err) = sched.remove(&job_id).await {
                    warn!(source_id = %config.source_id, error = %err, "failed to remove previous timer");
                }
            }
            self.add_timer(sched, &config).await?;
        }
        Ok(())
    }

    pub fn set_enabled(&self, source_id: &str, enabled: bool) -> Result<(), TriggerError> {
        let mut sources = lock(&self.inner.sources);
        let entry = sources
            .get_mut(source_id)
            .ok_or_else(|| TriggerError::UnknownSource(source_id.to_string()))?;
        entry.state.enabled = enabled;
        info!(source_id, enabled, "source toggled");
        Ok(())
    }

    pub fn state(&self, source_id: &str) -> Option<SourceRunState> {
        lock(&self.inner.sources).get(source_id).map(|e| e.state.clone())
    }

    pub fn sources(&self) -> Vec<Arc<SourceConfig>> {
        let mut configs: Vec<_> = lock(&self.inner.sources).values().map(|e| e.config.clone()).collect();
        configs.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        configs
    }

    /// A timer fired. Disabled sources ignore it; a busy source counts it as missed.
    pub fn trigger_scheduled(&self, source_id: &str) -> Result<Option<JoinHandle<RunRecord>>, TriggerError> {
        match self.admit(source_id, TriggerKind::Scheduled)? {
            Some(admitted) => Ok(Some(self.launch(source_id, admitted, TriggerKind::Scheduled))),
            None => Ok(None),
        }
    }

    /// Administrative trigger: bypasses the timer and the enabled flag, never queues behind its own source.
    pub fn force_run(&self, source_id: &str) -> Result<JoinHandle<RunRecord>, TriggerError> {
        let admitted = self
            .admit(source_id, TriggerKind::Forced)?
            .ok_or_else(|| TriggerError::UnknownSource(source_id.to_string()))?;
        Ok(self.launch(source_id, admitted, TriggerKind::Forced))
    }

    /// Arm one timer per registered source.
    pub async fn start(&self) -> Result<(), ScheduleError> {
        let mut timers = self.inner.timers.lock().await;
        if timers.is_some() {
            return Ok(());
        }
        let sched = JobScheduler::new().await.map_err(|e| ScheduleError::Timer(e.to_string()))?;
        for config in self.sources() {
            self.add_timer(&sched, &config).await?;
        }
        sched.start().await.map_err(|e| ScheduleError::Timer(e.to_string()))?;
        *timers = Some(sched);
        info!(sources = lock(&self.inner.sources).len(), "scheduler started");
        Ok(())
    }

    /// Stop timers, ask in-flight runs to wrap up, and wait until every run has a terminal record.
    pub async fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if let Some(mut sched) = self.inner.timers.lock().await.take() {
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "timer shutdown failed");
            }
        }
        self.wait_idle().await;
        info!("scheduler stopped");
    }

    /// Resolves once no run is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn is_stopping(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    fn admit(&self, source_id: &str, trigger: TriggerKind) -> Result<Option<Admitted>, TriggerError> {
        if self.is_stopping() {
            return Err(TriggerError::ShuttingDown);
        }
        let missed = {
            let mut sources = lock(&self.inner.sources);
            let entry = sources
                .get_mut(source_id)
                .ok_or_else(|| TriggerError::UnknownSource(source_id.to_string()))?;
            if trigger == TriggerKind::Scheduled && !entry.state.enabled {
                debug!(source_id, "trigger ignored; source disabled");
                return Ok(None);
            }
            match entry.state.current_run {
                Some(run_id) if entry.state.running => {
                    if trigger == TriggerKind::Scheduled {
                        entry.state.missed_triggers += 1;
                    }
                    (run_id, entry.state.missed_triggers)
                }
                _ => {
                    let run_id = Uuid::new_v4();
                    entry.state.running = true;
                    entry.state.current_run = Some(run_id);
                    entry.state.current_started_at = Some(Utc::now());
                    self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Ok(Some(Admitted {
                        run_id,
                        config: entry.config.clone(),
                        adapter: entry.adapter.clone(),
                    }));
                }
            }
        };

        let (run_id, missed_total) = missed;
        if trigger == TriggerKind::Scheduled {
            self.inner.telemetry.emit(TelemetryEvent::MissedTrigger {
                source_id: source_id.to_string(),
                at: Utc::now(),
                in_flight_run: Some(run_id),
                missed_total,
            });
        }
        Err(TriggerError::AlreadyRunning {
            source_id: source_id.to_string(),
            run_id,
        })
    }

    fn launch(&self, source_id: &str, admitted: Admitted, trigger: TriggerKind) -> JoinHandle<RunRecord> {
        let gate = self.acquire_slot();
        let scheduler = self.clone();
        let source_id = source_id.to_string();
        tokio::spawn(async move {
            let queued_at = Utc::now();
            if let Some(gate) = gate {
                debug!(%source_id, run_id = %admitted.run_id, "waiting for a run slot");
                // A dropped sender still hands over the slot; it only happens on teardown.
                let _ = gate.await;
            }
            let record = scheduler.execute(&source_id, admitted, trigger, queued_at).await;
            scheduler.release_slot();
            scheduler.complete(&source_id, &record);
            record
        })
    }

    async fn execute(&self, source_id: &str, admitted: Admitted, trigger: TriggerKind, queued_at: DateTime<Utc>) -> RunRecord {
        let coordinator = self.inner.coordinator.clone();
        let run_id = admitted.run_id;
        if self.is_stopping() {
            return coordinator
                .record_abandoned(run_id, source_id, trigger, queued_at, "scheduler shut down before the run started")
                .await;
        }

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run_with_id(run_id, admitted.config, admitted.adapter, trigger)
                    .await
            })
        };
        match task.await {
            Ok(record) => record,
            Err(err) => {
                error!(%source_id, %run_id, error = %err, "run task died; recording failure");
                let reason = if err.is_panic() {
                    "run panicked before completing".to_string()
                } else {
                    format!("run aborted: {err}")
                };
                coordinator.record_abandoned(run_id, source_id, trigger, queued_at, &reason).await
            }
        }
    }

    fn complete(&self, source_id: &str, record: &RunRecord) {
        {
            let mut sources = lock(&self.inner.sources);
            if let Some(entry) = sources.get_mut(source_id) {
                let state = &mut entry.state;
                state.running = false;
                state.current_run = None;
                state.current_started_at = None;
                state.last_run_id = Some(record.run_id);
                state.last_outcome = Some(record.outcome);
                state.last_finished_at = Some(record.finished_at);
                if record.outcome.is_schedule_healthy() {
                    state.consecutive_failures = 0;
                } else {
                    state.consecutive_failures += 1;
                }
            }
        }
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    /// `None` when a slot is free now; otherwise a receiver resolved in arrival order.
    fn acquire_slot(&self) -> Option<oneshot::Receiver<()>> {
        let mut queue = lock(&self.inner.queue);
        if queue.active < queue.limit {
            queue.active += 1;
            return None;
        }
        let (tx, rx) = oneshot::channel();
        queue.waiting.push_back(tx);
        Some(rx)
    }

    fn release_slot(&self) {
        let mut queue = lock(&self.inner.queue);
        while let Some(next) = queue.waiting.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        queue.active = queue.active.saturating_sub(1);
    }

    async fn add_timer(&self, sched: &JobScheduler, config: &SourceConfig) -> Result<(), ScheduleError> {
        let job = self.timer_job(config)?;
        let job_id = sched.add(job).await.map_err(|e| ScheduleError::Timer(e.to_string()))?;
        if let Some(entry) = lock(&self.inner.sources).get_mut(&config.source_id) {
            entry.job_id = Some(job_id);
        }
        Ok(())
    }

    fn timer_job(&self, config: &SourceConfig) -> Result<Job, ScheduleError> {
        let weak = Arc::downgrade(&self.inner);
        let source_id = config.source_id.clone();
        match config.cron.as_deref() {
            Some(cron) => Job::new_async(cron, move |_job, _sched| {
                let weak = weak.clone();
                let source_id = source_id.clone();
                Box::pin(async move { on_timer(weak, &source_id) })
            })
            .map_err(|e| ScheduleError::Cron {
                source_id: config.source_id.clone(),
                message: e.to_string(),
            }),
            None => Job::new_repeated_async(config.interval.as_duration(), move |_job, _sched| {
                let weak = weak.clone();
                let source_id = source_id.clone();
                Box::pin(async move { on_timer(weak, &source_id) })
            })
            .map_err(|e| ScheduleError::Timer(e.to_string())),
        }
    }
}

fn on_timer(inner: Weak<Inner>, source_id: &str) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    match (Scheduler { inner }).trigger_scheduled(source_id) {
        Ok(_) => {}
        Err(TriggerError::AlreadyRunning { .. }) => {}
        Err(err) => debug!(source_id, error = %err, "timer trigger dropped"),
    }
}

fn validate_schedule(config: &SourceConfig) -> Result<(), ScheduleError> {
    check_source(config)?;
    match config.cron.as_deref() {
        Some(cron) => {
            Job::new_async(cron, |_job, _sched| Box::pin(async {})).map_err(|e| ScheduleError::Cron {
                source_id: config.source_id.clone(),
                message: e.to_string(),
            })?;
        }
        None if config.interval.as_duration() < MIN_INTERVAL => {
            return Err(ScheduleError::IntervalTooShort {
                source_id: config.source_id.clone(),
                interval: config.interval,
            });
        }
        None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str) -> SourceConfig {
        let mut config = SourceConfig::new(id, "html", "https://example.org");
        config.listing_urls = vec!["https://example.org/news?page={page}".into()];
        config
    }

    #[tokio::test]
    async fn interval_floor_is_one_minute() {
        let mut config = source("s1");
        config.interval = FetchInterval::from_duration(Duration::from_secs(30));
        assert!(matches!(validate_schedule(&config), Err(ScheduleError::IntervalTooShort { .. })));
        config.interval = FetchInterval::from_minutes(1);
        assert!(validate_schedule(&config).is_ok());
    }

    #[tokio::test]
    async fn cron_expressions_are_checked() {
        let mut config = source("s1");
        config.cron = Some("not a cron".into());
        assert!(matches!(validate_schedule(&config), Err(ScheduleError::Cron { .. })));
        config.cron = Some("0 */15 * * * *".into());
        assert!(validate_schedule(&config).is_ok());
    }

    #[tokio::test]
    async fn config_errors_pass_through() {
        let mut config = source("s1");
        config.listing_urls.clear();
        assert!(matches!(validate_schedule(&config), Err(ScheduleError::Config(_))));
    }
}
