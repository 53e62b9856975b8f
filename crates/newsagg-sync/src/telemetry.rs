//! Best-effort telemetry. `emit` never blocks or fails the pipeline.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use newsagg_core::{RunOutcome, RunRecord};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TELEMETRY_FILE: &str = "telemetry.jsonl";
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    RunFinished(RunRecord),
    /// A due trigger arrived while the source's previous run was still in flight.
    MissedTrigger {
        source_id: String,
        at: DateTime<Utc>,
        in_flight_run: Option<Uuid>,
        missed_total: u64,
    },
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::RunFinished(record) => {
                let c = record.counts;
                if record.outcome == RunOutcome::Failed {
                    warn!(
                        run_id = %record.run_id,
                        source_id = %record.source_id,
                        outcome = record.outcome.as_str(),
                        error = record.error_summary.as_deref().unwrap_or(""),
                        "run finished"
                    );
                } else {
                    info!(
                        run_id = %record.run_id,
                        source_id = %record.source_id,
                        outcome = record.outcome.as_str(),
                        discovered = c.discovered,
                        fetched = c.fetched,
                        new = c.new,
                        updated = c.updated,
                        duplicate = c.duplicate,
                        rejected = c.rejected,
                        skipped = c.skipped,
                        "run finished"
                    );
                }
            }
            TelemetryEvent::MissedTrigger {
                source_id,
                missed_total,
                ..
            } => warn!(%source_id, missed_total, "trigger skipped; previous run still in flight"),
        }
    }
}

/// Collects events in memory; used by tests and the CLI's one-shot mode.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn missed_triggers(&self, source_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::MissedTrigger { source_id: s, .. } if s == source_id))
            .count()
    }

    pub fn finished_runs(&self) -> Vec<RunRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TelemetryEvent::RunFinished(record) => Some(record),
                TelemetryEvent::MissedTrigger { .. } => None,
            })
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Appends events as JSON lines from a background task fed by a bounded channel.
#[derive(Debug, Clone)]
pub struct JsonLinesTelemetry {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl JsonLinesTelemetry {
    pub async fn spawn(dir: &Path) -> Result<(Self, JoinHandle<()>)> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path: PathBuf = dir.join(TELEMETRY_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;

        let (tx, mut rx) = mpsc::channel::<TelemetryEvent>(CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "unserializable telemetry event");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    warn!(path = %path.display(), error = %err, "telemetry write failed");
                }
            }
            if let Err(err) = file.flush().await {
                warn!(error = %err, "telemetry flush failed");
            }
            debug!("telemetry writer stopped");
        });
        Ok((Self { tx }, handle))
    }
}

impl TelemetrySink for JsonLinesTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("telemetry channel full; event dropped"),
            Err(TrySendError::Closed(_)) => debug!("telemetry writer gone; event dropped"),
        }
    }
}

/// Forwards every event to each inner sink.
#[derive(Clone, Default)]
pub struct FanoutTelemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutTelemetry {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for FanoutTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
