//! Turns queued job requests into on-demand runners.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_id::InstanceId;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::queue::{Delivery, JobQueue};
use crate::capacity::Admission;
use crate::config::ReactiveSettings;
use crate::error::{FleetError, Result};
use crate::provision::Provisioner;
use crate::reconciler::PassReport;
use crate::types::{FleetTarget, JobRequest};

/// What happened to one job request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// A runner was created for the job.
    Spawned(InstanceId),

    /// A runner for this job exists, is being created, or already ran.
    Duplicate,

    /// Another runner already took the job.
    AlreadyPickedUp,

    /// Capacity or quarantine prevents a spawn right now.
    Deferred(String),

    /// The request can never be served.
    Rejected(String),

    /// The create failed; the job is retried later.
    Failed(String),
}

impl Disposition {
    async fn settle(&self, delivery: Delivery) -> Result<()> {
        match self {
            Disposition::Spawned(_) | Disposition::Duplicate | Disposition::AlreadyPickedUp => {
                delivery.ack().await
            }
            Disposition::Deferred(_) | Disposition::Failed(_) => delivery.requeue().await,
            Disposition::Rejected(_) => delivery.reject().await,
        }
    }
}

/// Counts for one consumed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub pulled: u32,
    pub spawned: u32,
    pub duplicates: u32,
    pub picked_up: u32,
    pub deferred: u32,
    pub rejected: u32,
    pub failed: u32,
}

impl BatchReport {
    fn count(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Spawned(_) => self.spawned += 1,
            Disposition::Duplicate => self.duplicates += 1,
            Disposition::AlreadyPickedUp => self.picked_up += 1,
            Disposition::Deferred(_) => self.deferred += 1,
            Disposition::Rejected(_) => self.rejected += 1,
            Disposition::Failed(_) => self.failed += 1,
        }
    }
}

/// Exponential delay between queue reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &ReactiveSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.backoff_initial_ms),
            max: Duration::from_secs(settings.backoff_max_secs),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Pulls job requests and spawns runners for them.
pub struct ReactiveConsumer {
    queue: Arc<dyn JobQueue>,
    provisioner: Arc<Provisioner>,
    target: watch::Receiver<FleetTarget>,
    settings: ReactiveSettings,
}

impl ReactiveConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        provisioner: Arc<Provisioner>,
        target: watch::Receiver<FleetTarget>,
        settings: ReactiveSettings,
    ) -> Self {
        Self {
            queue,
            provisioner,
            target,
            settings,
        }
    }

    /// Decide and act on one message.
    pub async fn handle(&self, payload: &[u8], target: &FleetTarget) -> Disposition {
        let job: JobRequest = match serde_json::from_slice(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Unparseable job request");
                return Disposition::Rejected(FleetError::InvalidJobRequest(e.to_string()).to_string());
            }
        };

        if let Some(label) = self.unsupported_label(&job, target) {
            warn!(job_id = %job.id.as_str(), label = %label, "Job requests unsupported label");
            return Disposition::Rejected(format!("unsupported label '{label}'"));
        }
        let Some(spec) = target.spec_for_job(&job.flavor, &job.label) else {
            warn!(job_id = %job.id.as_str(), flavor = %job.flavor, label = %job.label, "No runner spec for job");
            return Disposition::Rejected(format!("no spec for {}/{}", job.flavor, job.label));
        };

        {
            let ledger = self.provisioner.gate().lock().await;
            if let Some(existing) = ledger.lookup_dedup(&job.id) {
                debug!(job_id = %job.id.as_str(), instance_id = %existing, "Runner for job already exists");
                return Disposition::Duplicate;
            }
            if ledger.is_consumed(&job.id) {
                debug!(job_id = %job.id.as_str(), "Job already served");
                return Disposition::Duplicate;
            }
        }

        match self.provisioner.platform().job_picked_up(&job).await {
            Ok(true) => {
                info!(job_id = %job.id.as_str(), "Job already picked up, not spawning");
                return Disposition::AlreadyPickedUp;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(job_id = %job.id.as_str(), error = %e, "Could not check job status, spawning anyway");
            }
        }

        let admission = {
            let mut ledger = self.provisioner.gate().lock().await;
            ledger.try_admit(spec, &job.id, Utc::now())
        };
        let id = match admission {
            Admission::Reserved(id) => id,
            Admission::Duplicate(_) | Admission::Consumed => return Disposition::Duplicate,
            Admission::Quarantined { until } => {
                debug!(job_id = %job.id.as_str(), spec = %spec.key(), until = ?until, "Spec quarantined, deferring job");
                return Disposition::Deferred(format!("spec {} quarantined", spec.key()));
            }
            Admission::CapReached => {
                debug!(job_id = %job.id.as_str(), "Global cap reached, deferring job");
                return Disposition::Deferred("global cap reached".to_string());
            }
        };

        match self.provisioner.create(id, spec, Some(job.id.clone())).await {
            Ok(created) => {
                info!(job_id = %job.id.as_str(), instance_id = %created, spec = %spec.key(), "Spawned runner for job");
                Disposition::Spawned(created)
            }
            Err(e) => Disposition::Failed(e.to_string()),
        }
    }

    fn unsupported_label(&self, job: &JobRequest, target: &FleetTarget) -> Option<String> {
        let supported: BTreeSet<String> = self
            .settings
            .supported_labels
            .iter()
            .cloned()
            .chain(target.specs.iter().flat_map(|s| [s.flavor.clone(), s.label.clone()]))
            .map(|l| l.to_lowercase())
            .collect();

        std::iter::once(&job.label)
            .chain(&job.labels)
            .find(|l| !supported.contains(&l.to_lowercase()))
            .cloned()
    }

    /// Pull and settle one batch.
    ///
    /// One message failing to settle does not stop the rest of the batch.
    pub async fn consume_batch(&self) -> Result<BatchReport> {
        let deliveries = self.queue.pull(self.settings.batch_size.max(1)).await?;
        let target = self.target.borrow().clone();
        let mut report = BatchReport {
            pulled: deliveries.len() as u32,
            ..BatchReport::default()
        };

        for delivery in deliveries {
            let disposition = self.handle(&delivery.payload, &target).await;
            report.count(&disposition);
            if let Err(e) = disposition.settle(delivery).await {
                warn!(error = %e, disposition = ?disposition, "Failed to settle job message");
            }
        }

        if report.pulled > 0 {
            info!(
                pulled = report.pulled,
                spawned = report.spawned,
                duplicates = report.duplicates,
                deferred = report.deferred,
                rejected = report.rejected,
                failed = report.failed,
                "Consumed job batch"
            );
        }
        Ok(report)
    }

    /// Consume until shutdown.
    ///
    /// Waits for the first reconciliation pass so that the ledger knows
    /// existing runners before any dedup decision.
    pub async fn run(
        &self,
        mut passes: watch::Receiver<Option<Arc<PassReport>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        while passes.borrow_and_update().is_none() {
            tokio::select! {
                changed = passes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }

        info!(batch_size = self.settings.batch_size, "Reactive consumer started");
        let backoff = BackoffPolicy::from_settings(&self.settings);
        let idle = Duration::from_secs(self.settings.poll_interval_secs);
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match self.consume_batch().await {
                Ok(report) => {
                    if failures > 0 {
                        info!("Job queue available again");
                    }
                    failures = 0;
                    if report.pulled == 0 || report.pulled == report.deferred {
                        idle
                    } else {
                        Duration::ZERO
                    }
                }
                Err(e) => {
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Job queue unavailable");
                    delay
                }
            };

            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Reactive consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MockBackend};
    use crate::capacity::{CapacityGate, FleetLedger};
    use crate::platform::MockPlatform;
    use crate::reactive::queue::MemoryQueue;
    use crate::types::{BackendKind, ExitReason, RunnerSpec};
    use fleet_id::DedupKey;
    use std::collections::BTreeMap;

    struct Fixture {
        queue: MemoryQueue,
        backend: Arc<MockBackend>,
        platform: Arc<MockPlatform>,
        gate: Arc<CapacityGate>,
        consumer: ReactiveConsumer,
    }

    fn target(cap: Option<u32>) -> FleetTarget {
        FleetTarget {
            specs: vec![RunnerSpec {
                flavor: "small".to_string(),
                label: "x64".to_string(),
                image: "noble".to_string(),
                desired: 0,
                backend: BackendKind::Mock,
            }],
            global_cap: cap,
        }
    }

    fn fixture(cap: Option<u32>) -> Fixture {
        let queue = MemoryQueue::new();
        let backend = Arc::new(MockBackend::new());
        let platform = Arc::new(MockPlatform::new());
        let mut ledger = FleetLedger::new(2, Duration::from_secs(600), Duration::from_secs(3600));
        ledger.set_cap(cap);
        let gate = Arc::new(CapacityGate::new(ledger));
        let mut backends: BTreeMap<BackendKind, Arc<dyn Backend>> = BTreeMap::new();
        backends.insert(BackendKind::Mock, backend.clone());
        let provisioner = Arc::new(Provisioner::new(backends, platform.clone(), gate.clone()));
        let (_tx, rx) = watch::channel(target(cap));
        let settings = ReactiveSettings {
            enabled: true,
            ..ReactiveSettings::default()
        };
        let consumer = ReactiveConsumer::new(Arc::new(queue.clone()), provisioner, rx, settings);
        Fixture {
            queue,
            backend,
            platform,
            gate,
            consumer,
        }
    }

    fn job(id: &str) -> JobRequest {
        JobRequest {
            id: DedupKey::new(id).unwrap(),
            flavor: "small".to_string(),
            label: "x64".to_string(),
            enqueue_time: Utc::now(),
            labels: vec!["self-hosted".to_string(), "X64".to_string()],
            job_url: None,
        }
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawns_runner_tagged_with_job() {
        let f = fixture(None);
        f.queue.push_json(&job("1001")).unwrap();

        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.spawned, 1);
        assert_eq!(f.queue.acked(), 1);

        let instances = f.backend.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].dedup_key.as_ref().unwrap().as_str(), "1001");
    }

    #[tokio::test]
    async fn test_redelivery_spawns_once() {
        let f = fixture(None);
        f.queue.push_json(&job("1001")).unwrap();
        f.queue.push_json(&job("1001")).unwrap();
        f.queue.push_json(&job("1001")).unwrap();

        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.spawned, 1);
        assert_eq!(report.duplicates, 2);
        assert_eq!(f.backend.create_calls(), 1);
        assert_eq!(f.queue.acked(), 3);
    }

    #[tokio::test]
    async fn test_consumed_job_is_not_respawned() {
        let f = fixture(None);
        f.queue.push_json(&job("7")).unwrap();
        f.consumer.consume_batch().await.unwrap();
        let runner = f.backend.instances()[0].id;

        // Runner finishes its job and disappears
        f.backend.terminate(&runner);
        {
            let mut ledger = f.gate.lock().await;
            ledger.mark_terminal(&runner, ExitReason::Vanished);
            ledger.take_terminal(Utc::now());
        }

        f.queue.push_json(&job("7")).unwrap();
        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn test_cap_defers_without_blocking_batch() {
        let f = fixture(Some(1));
        f.queue.push_json(&job("1")).unwrap();
        f.queue.push_json(&job("2")).unwrap();
        f.queue.push(b"not json".to_vec());

        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.spawned, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(f.queue.requeued(), 1);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.backend.len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_labels_rejected() {
        let f = fixture(None);
        let mut gpu = job("1");
        gpu.labels.push("gpu".to_string());
        f.queue.push_json(&gpu).unwrap();

        let mut unknown_spec = job("2");
        unknown_spec.flavor = "huge".to_string();
        f.queue.push_json(&unknown_spec).unwrap();

        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.rejected, 2);
        assert_eq!(f.queue.rejected(), 2);
        assert_eq!(f.backend.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_picked_up_job_is_acked() {
        let f = fixture(None);
        let request = job("55");
        f.platform.mark_picked_up(&request.id);
        f.queue.push_json(&request).unwrap();

        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.picked_up, 1);
        assert_eq!(f.queue.acked(), 1);
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_requeues_and_frees_key() {
        let f = fixture(None);
        f.backend
            .fail_next_creates(FleetError::Provision("boot failure".into()), 1);
        f.queue.push_json(&job("9")).unwrap();

        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.queue.requeued(), 1);

        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.spawned, 1);
        assert_eq!(f.backend.len(), 1);
    }

    #[tokio::test]
    async fn test_quarantined_spec_defers() {
        let f = fixture(None);
        f.backend
            .set_create_error(Some(FleetError::QuotaExceeded("cores".into())));
        f.queue.push_json(&job("1")).unwrap();
        f.queue.push_json(&job("2")).unwrap();
        f.consumer.consume_batch().await.unwrap();

        // Threshold of two failures reached
        f.queue.push_json(&job("3")).unwrap();
        let report = f.consumer.consume_batch().await.unwrap();
        assert_eq!(report.deferred, 3);
        assert_eq!(f.backend.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_queue_outage_is_error() {
        let f = fixture(None);
        f.queue.set_unavailable(true);
        assert!(matches!(
            f.consumer.consume_batch().await,
            Err(FleetError::QueueUnavailable(_))
        ));
    }
}
