//! Job outcome collection and metric emission.
//!
//! Runners write a job outcome record to the metrics exchange before they
//! exit. Once a runner is confirmed terminal its record is read, turned into
//! a metric event and emitted exactly once. Runners that died before writing
//! a record get a synthesized abnormal/unknown outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{JobOutcomeRecord, MetricEvent, ReconciliationMetric};
use fleet_id::InstanceId;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::types::RunnerInstance;

/// File each runner writes its outcome to, inside its exchange directory.
pub const OUTCOME_FILE: &str = "job_outcome.json";

// =============================================================================
// Exchange
// =============================================================================

/// Where runners leave their job outcome records.
#[async_trait]
pub trait MetricsExchange: Send + Sync {
    /// Raw record for a runner, if it wrote one.
    async fn read(&self, id: &InstanceId) -> Result<Option<Vec<u8>>>;

    /// Discard everything stored for a runner.
    async fn remove(&self, id: &InstanceId) -> Result<()>;
}

/// Exchange on a shared directory: `{dir}/{instance_id}/job_outcome.json`.
pub struct FsExchange {
    dir: PathBuf,
}

impl FsExchange {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn runner_dir(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(id.to_string())
    }
}

#[async_trait]
impl MetricsExchange for FsExchange {
    async fn read(&self, id: &InstanceId) -> Result<Option<Vec<u8>>> {
        let path = self.runner_dir(id).join(OUTCOME_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FleetError::Exchange(format!("{}: {e}", path.display()))),
        }
    }

    async fn remove(&self, id: &InstanceId) -> Result<()> {
        let dir = self.runner_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::Exchange(format!("{}: {e}", dir.display()))),
        }
    }
}

/// In-memory exchange for tests.
#[derive(Default)]
pub struct MemoryExchange {
    records: Mutex<BTreeMap<InstanceId, Vec<u8>>>,
}

impl MemoryExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: InstanceId, bytes: impl Into<Vec<u8>>) {
        lock(&self.records).insert(id, bytes.into());
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        lock(&self.records).contains_key(id)
    }
}

#[async_trait]
impl MetricsExchange for MemoryExchange {
    async fn read(&self, id: &InstanceId) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.records).get(id).cloned())
    }

    async fn remove(&self, id: &InstanceId) -> Result<()> {
        lock(&self.records).remove(id);
        Ok(())
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Destination of metric events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &MetricEvent) -> Result<()>;
}

/// Appends one JSON object per line to a log file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }
}

#[async_trait]
impl EventSink for JsonLinesSink {
    async fn emit(&self, event: &MetricEvent) -> Result<()> {
        let line = event
            .to_json_line()
            .map_err(|e| FleetError::Exchange(e.to_string()))?;

        let mut file = self.file.lock().await;
        if file.is_none() {
            let opened = self
                .open()
                .await
                .map_err(|e| FleetError::Exchange(format!("{}: {e}", self.path.display())))?;
            *file = Some(opened);
        }
        let Some(handle) = file.as_mut() else {
            return Err(FleetError::Exchange("metric log not open".to_string()));
        };

        if let Err(e) = handle.write_all(line.as_bytes()).await {
            // Reopen on the next event
            *file = None;
            return Err(FleetError::Exchange(format!("{}: {e}", self.path.display())));
        }
        handle
            .flush()
            .await
            .map_err(|e| FleetError::Exchange(e.to_string()))
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<MetricEvent>>,
    fail: Mutex<bool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        lock(&self.events).clone()
    }

    /// Outcome events only.
    pub fn outcomes(&self) -> Vec<(InstanceId, JobOutcomeRecord)> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                MetricEvent::RunnerJobOutcome {
                    instance_id,
                    record,
                    ..
                } => Some((*instance_id, record.clone())),
                MetricEvent::Reconciliation(_) => None,
            })
            .collect()
    }

    pub fn set_failing(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: &MetricEvent) -> Result<()> {
        if *lock(&self.fail) {
            return Err(FleetError::Exchange("sink unavailable".to_string()));
        }
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Aggregator
// =============================================================================

#[derive(Debug, Clone)]
struct PendingEvent {
    /// Runner whose exchange entry is removed once the event is emitted.
    instance: Option<InstanceId>,
    event: MetricEvent,
}

/// Turns terminal runners into outcome events.
///
/// Events that could not be emitted stay queued and are retried on the next
/// call; each runner's outcome is queued exactly once.
pub struct MetricsAggregator {
    exchange: Arc<dyn MetricsExchange>,
    sink: Arc<dyn EventSink>,
    pending: tokio::sync::Mutex<Vec<PendingEvent>>,
}

impl MetricsAggregator {
    pub fn new(
        exchange: Arc<dyn MetricsExchange>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            exchange,
            sink,
            pending: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Read the outcome record of a terminal runner.
    pub async fn outcome_for(&self, instance: &RunnerInstance, now: DateTime<Utc>) -> JobOutcomeRecord {
        match self.exchange.read(&instance.id).await {
            Ok(Some(bytes)) => match JobOutcomeRecord::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Invalid job outcome record");
                    JobOutcomeRecord::unknown(now)
                }
            },
            Ok(None) => {
                debug!(instance_id = %instance.id, "No job outcome record");
                JobOutcomeRecord::unknown(now)
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Failed to read job outcome record");
                JobOutcomeRecord::unknown(now)
            }
        }
    }

    /// Queue outcome events for runners that just went terminal.
    ///
    /// Returns the records so callers can count abnormal outcomes.
    pub async fn record_terminated(
        &self,
        terminated: &[RunnerInstance],
        now: DateTime<Utc>,
    ) -> Vec<(InstanceId, JobOutcomeRecord)> {
        let mut records = Vec::with_capacity(terminated.len());
        let mut queued = Vec::with_capacity(terminated.len());
        for instance in terminated {
            let record = self.outcome_for(instance, now).await;
            queued.push(PendingEvent {
                instance: Some(instance.id),
                event: MetricEvent::RunnerJobOutcome {
                    instance_id: instance.id,
                    flavor: instance.spec.flavor.clone(),
                    record: record.clone(),
                },
            });
            records.push((instance.id, record));
        }
        self.pending.lock().await.extend(queued);
        records
    }

    /// Queue per-spec reconciliation summaries.
    pub async fn record_reconciliation(&self, metrics: Vec<ReconciliationMetric>) {
        self.pending
            .lock()
            .await
            .extend(metrics.into_iter().map(|m| PendingEvent {
                instance: None,
                event: MetricEvent::Reconciliation(m),
            }));
    }

    /// Emit queued events. Returns how many were emitted.
    pub async fn flush(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let queued = std::mem::take(&mut *pending);
        let mut emitted = 0;

        let mut remaining = queued.into_iter();
        for item in remaining.by_ref() {
            if let Err(e) = self.sink.emit(&item.event).await {
                warn!(event = item.event.name(), error = %e, "Failed to emit metric event, will retry");
                pending.push(item);
                break;
            }
            emitted += 1;
            if let Some(id) = item.instance {
                if let Err(e) = self.exchange.remove(&id).await {
                    warn!(instance_id = %id, error = %e, "Failed to clean up exchange entry");
                }
            }
        }
        pending.extend(remaining);

        if emitted > 0 {
            info!(emitted, "Emitted metric events");
        }
        emitted
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}
