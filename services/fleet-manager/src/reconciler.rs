//! The reconciliation pass.
//!
//! One pass:
//!
//! 1. Lists platform registrations and every backend, merging listings into
//!    the ledger (runners gone from a listing become terminal).
//! 2. Probes pending runners that have not registered yet.
//! 3. Classifies runners and builds the inventory.
//! 4. Plans deletes and creates under the capacity gate lock, reserving
//!    capacity for every planned create.
//! 5. Executes the plan on a bounded worker pool until done or the pass
//!    deadline passes.
//! 6. Emits outcome and reconciliation metrics.
//!
//! A pass never returns an error. Unavailable collaborators show up in the
//! report's health.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{OutcomeStatus, ReconciliationMetric};
use fleet_id::{InstanceId, PassId};
use fleet_reconcile::{bounded_creates, select_for_deletion, DeletionPriority, PassHealth};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::health::{HealthMonitor, Observations};
use crate::inventory::{FleetInventory, InventoryCounts};
use crate::metrics::MetricsAggregator;
use crate::provision::Provisioner;
use crate::types::{
    BackendInstance, BackendKind, ExitReason, FleetTarget, FlushMode, Lifecycle, Registration,
    RunnerSpec, SpecKey,
};

/// Pass tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Concurrent backend calls within a pass.
    pub worker_concurrency: usize,

    /// Overall budget for one pass.
    pub pass_timeout: Duration,

    /// How long a job runner may sit idle before it is retired.
    pub reactive_idle_grace: Duration,
}

impl ReconcilerSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            worker_concurrency: config.worker_concurrency.max(1),
            pass_timeout: config.pass_timeout(),
            reactive_idle_grace: config.reactive_idle_grace(),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// What one backend looked like during a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendReport {
    pub reachable: bool,
    pub listed: usize,
    pub adopted: usize,
    pub terminated: usize,

    /// Mutations were stopped part-way through the pass.
    pub halted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What happened to one spec during a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpecReport {
    pub counts: InventoryCounts,
    pub planned_creates: u32,
    pub planned_deletes: u32,
    pub created: u32,
    pub deleted: u32,
    pub failed: u32,

    /// Creates suppressed by quarantine.
    pub quarantined: bool,

    /// Creates that did not fit under the global cap.
    pub cap_limited: u32,

    /// The spec's backend was unreachable and nothing was attempted.
    pub backend_unavailable: bool,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: PassId,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub health: PassHealth,
    pub platform_available: bool,
    pub backends: BTreeMap<BackendKind, BackendReport>,
    pub specs: BTreeMap<SpecKey, SpecReport>,
    pub registrations_deleted: u32,

    /// Runners that became terminal and were handed to metrics.
    pub terminated: u32,

    /// Operations left unfinished when the pass deadline passed.
    pub abandoned: u32,
    pub timed_out: bool,
}

impl PassReport {
    fn new(pass_id: PassId, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id,
            started_at,
            duration_ms: 0,
            health: PassHealth::Healthy,
            platform_available: true,
            backends: BTreeMap::new(),
            specs: BTreeMap::new(),
            registrations_deleted: 0,
            terminated: 0,
            abandoned: 0,
            timed_out: false,
        }
    }

    pub fn created(&self) -> u32 {
        self.specs.values().map(|s| s.created).sum()
    }

    pub fn deleted(&self) -> u32 {
        self.specs.values().map(|s| s.deleted).sum()
    }

    pub fn failed(&self) -> u32 {
        self.specs.values().map(|s| s.failed).sum()
    }

    pub fn spec(&self, key: &SpecKey) -> Option<&SpecReport> {
        self.specs.get(key)
    }

    fn assess_health(&mut self) {
        let unreachable = self
            .backends
            .values()
            .filter(|b| !b.reachable || b.halted)
            .count();

        self.health = if !self.backends.is_empty() && unreachable == self.backends.len() {
            PassHealth::Blocked
        } else if unreachable > 0
            || !self.platform_available
            || self.timed_out
            || self.specs.values().any(|s| s.quarantined || s.backend_unavailable)
        {
            PassHealth::Degraded
        } else {
            PassHealth::Healthy
        };
    }
}

/// Registration overview of the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerInfo {
    pub online: u32,
    pub busy: u32,
    pub offline: u32,

    /// Live runners with no registration.
    pub unknown: u32,
    pub online_runners: Vec<String>,
    pub busy_runners: Vec<String>,
}

/// Result of a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub deleted: u32,
    pub failed: u32,
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Clone)]
enum Operation {
    Create {
        id: InstanceId,
        spec: RunnerSpec,
    },
    Delete {
        id: InstanceId,
        spec: SpecKey,
        backend: BackendKind,
        registration: Option<u64>,
        priority: DeletionPriority,
    },
    DeleteRegistration {
        registration_id: u64,
    },
}

impl Operation {
    fn backend(&self) -> Option<BackendKind> {
        match self {
            Operation::Create { spec, .. } => Some(spec.backend),
            Operation::Delete { backend, .. } => Some(*backend),
            Operation::DeleteRegistration { .. } => None,
        }
    }

    fn spec(&self) -> Option<SpecKey> {
        match self {
            Operation::Create { spec, .. } => Some(spec.key()),
            Operation::Delete { spec, .. } => Some(spec.clone()),
            Operation::DeleteRegistration { .. } => None,
        }
    }

    /// Give back anything the operation holds without running it.
    async fn discard(&self, provisioner: &Provisioner) {
        if let Operation::Create { id, .. } = self {
            provisioner.gate().release(id).await;
        }
    }

    async fn apply(&self, provisioner: &Provisioner) -> Result<()> {
        match self {
            Operation::Create { id, spec } => provisioner.create(*id, spec, None).await.map(|_| ()),
            Operation::Delete {
                id,
                backend,
                registration,
                priority,
                ..
            } => {
                debug!(instance_id = %id, priority = ?priority, "Deleting runner");
                provisioner
                    .delete(id, *backend, *registration, exit_reason(*priority))
                    .await
            }
            Operation::DeleteRegistration { registration_id } => {
                if provisioner.delete_registration(*registration_id).await {
                    Ok(())
                } else {
                    Err(FleetError::PlatformUnavailable(format!(
                        "registration {registration_id} not deleted"
                    )))
                }
            }
        }
    }
}

#[derive(Debug)]
enum OpOutcome {
    Done,
    Failed(FleetError),
    Skipped,

    /// The spec was quarantined after the create was planned.
    Quarantined,
    Abandoned,
}

#[derive(Debug)]
struct OpResult {
    op: Operation,
    outcome: OpOutcome,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Runs reconciliation passes against the fleet.
pub struct Reconciler {
    provisioner: Arc<Provisioner>,
    health: HealthMonitor,
    metrics: Arc<MetricsAggregator>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        provisioner: Arc<Provisioner>,
        health: HealthMonitor,
        metrics: Arc<MetricsAggregator>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            provisioner,
            health,
            metrics,
            settings,
        }
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Lift quarantine for specs whose build configuration changed.
    pub async fn apply_target_change(&self, previous: &FleetTarget, next: &FleetTarget) {
        let mut ledger = self.provisioner.gate().lock().await;
        ledger.set_cap(next.global_cap);
        for spec in &next.specs {
            let changed = previous
                .spec(&spec.key())
                .is_some_and(|old| old.fingerprint() != spec.fingerprint());
            if changed && ledger.quarantine_mut().clear(&spec.key()) {
                info!(spec = %spec.key(), "Spec configuration changed, quarantine lifted");
            }
        }
    }

    /// Run one pass against `target`.
    #[instrument(skip(self, target), fields(pass_id))]
    pub async fn run_pass(&self, target: &FleetTarget) -> PassReport {
        let pass_id = PassId::new();
        tracing::Span::current().record("pass_id", tracing::field::display(pass_id));
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = clock + self.settings.pass_timeout;
        let mut report = PassReport::new(pass_id, started_at);
        let gate = self.provisioner.gate();

        gate.set_cap(target.global_cap).await;
        debug!(specs = target.specs.len(), global_cap = ?target.global_cap, "Starting reconciliation pass");

        // Registrations
        let registrations = match self.provisioner.platform().list_registrations().await {
            Ok(registrations) => Some(registrations),
            Err(e) => {
                warn!(error = %e, "CI platform unavailable, orphan and health checks limited");
                report.platform_available = false;
                None
            }
        };

        // Backend listings
        let mut unreachable: BTreeSet<BackendKind> = BTreeSet::new();
        let mut lingering: Vec<(BackendKind, BackendInstance)> = Vec::new();
        for (kind, backend) in self.provisioner.backends() {
            let epoch = gate.lock().await.epoch();
            match backend.list_all().await {
                Ok(listing) => {
                    let outcome = gate.lock().await.resync(*kind, &listing, epoch);
                    for id in &outcome.terminated {
                        info!(instance_id = %id, backend = %kind, "Runner gone from backend");
                    }
                    lingering.extend(
                        listing
                            .iter()
                            .filter(|i| outcome.lingering.contains(&i.id))
                            .map(|i| (*kind, i.clone())),
                    );
                    report.backends.insert(
                        *kind,
                        BackendReport {
                            reachable: true,
                            listed: listing.len(),
                            adopted: outcome.adopted.len(),
                            terminated: outcome.terminated.len(),
                            ..BackendReport::default()
                        },
                    );
                }
                Err(e) => {
                    warn!(backend = %kind, error = %e, "Backend listing failed, skipping mutations");
                    unreachable.insert(*kind);
                    report.backends.insert(
                        *kind,
                        BackendReport {
                            error: Some(e.to_string()),
                            ..BackendReport::default()
                        },
                    );
                }
            }
        }

        // Probes
        let mut observations = Observations::new(registrations.as_deref());
        let probe_failures = self
            .probe_pending(&mut observations, &unreachable, deadline)
            .await;
        for (kind, failure) in probe_failures {
            warn!(backend = %kind, error = %failure, "Backend status checks failing, skipping mutations");
            unreachable.insert(kind);
            if let Some(backend_report) = report.backends.get_mut(&kind) {
                backend_report.reachable = false;
                backend_report.error = Some(failure);
            }
        }

        // Plan
        let now = Utc::now();
        let ops = {
            let mut ledger = gate.lock().await;
            for spec in &target.specs {
                if ledger
                    .quarantine_mut()
                    .observe_fingerprint(&spec.key(), &spec.fingerprint())
                {
                    info!(spec = %spec.key(), "Spec configuration changed, quarantine lifted");
                }
            }
            ledger
                .quarantine_mut()
                .retain_keys(|key| target.spec(key).is_some());
            ledger.prune(now);

            let conditions = self.health.assess(&mut ledger, &observations, now);
            let orphaned_registrations = match &registrations {
                Some(regs) if unreachable.is_empty() => {
                    self.health.orphaned_registrations(&ledger, regs, now)
                }
                _ => Vec::new(),
            };
            let inventory = FleetInventory::build(target, &ledger, &conditions, orphaned_registrations);

            let mut ops = Vec::new();
            for (key, spec_inventory) in &inventory.specs {
                let spec_report = report.specs.entry(key.clone()).or_default();
                spec_report.counts = spec_inventory.counts();

                let delta = spec_inventory.delta();
                let selected = select_for_deletion(
                    spec_inventory.deletion_candidates(),
                    delta.surplus,
                    |(_, priority)| *priority,
                    |(entry, _)| (entry.created_at, entry.id),
                );
                for (entry, priority) in selected {
                    if unreachable.contains(&entry.backend) {
                        spec_report.backend_unavailable = true;
                        continue;
                    }
                    spec_report.planned_deletes += 1;
                    ops.push(Operation::Delete {
                        id: entry.id,
                        spec: key.clone(),
                        backend: entry.backend,
                        registration: observations.registration(&entry.id).map(|r| r.id),
                        priority,
                    });
                }

                for entry in spec_inventory.stale_reactive(now, self.settings.reactive_idle_grace) {
                    if unreachable.contains(&entry.backend) {
                        spec_report.backend_unavailable = true;
                        continue;
                    }
                    info!(instance_id = %entry.id, spec = %key, "Job runner idle past grace, retiring");
                    spec_report.planned_deletes += 1;
                    ops.push(Operation::Delete {
                        id: entry.id,
                        spec: key.clone(),
                        backend: entry.backend,
                        registration: observations.registration(&entry.id).map(|r| r.id),
                        priority: DeletionPriority::Idle,
                    });
                }
            }

            for spec in &target.specs {
                let key = spec.key();
                let missing = inventory.spec(&key).map_or(spec.desired, |i| i.delta().missing);
                if missing == 0 {
                    continue;
                }
                let spec_report = report.specs.entry(key.clone()).or_default();

                if unreachable.contains(&spec.backend)
                    || self.provisioner.backend(spec.backend).is_none()
                {
                    spec_report.backend_unavailable = true;
                    warn!(spec = %key, backend = %spec.backend, missing, "Backend unavailable, creates skipped");
                    continue;
                }
                if ledger.is_quarantined(&key, now) {
                    spec_report.quarantined = true;
                    warn!(
                        spec = %key,
                        suppressed = missing,
                        until = ?ledger.quarantine().quarantined_until(&key, now),
                        "Spec quarantined, creates suppressed"
                    );
                    continue;
                }

                let allowed = bounded_creates(missing, ledger.headroom());
                let mut planned = 0;
                for _ in 0..allowed {
                    let id = InstanceId::new();
                    if !ledger.reserve(id, spec, None) {
                        break;
                    }
                    ops.push(Operation::Create {
                        id,
                        spec: spec.clone(),
                    });
                    planned += 1;
                }
                spec_report.planned_creates = planned;
                spec_report.cap_limited = missing - planned;
                if spec_report.cap_limited > 0 {
                    warn!(
                        spec = %key,
                        missing,
                        planned,
                        global_cap = ?ledger.cap(),
                        "Global cap reached, creates limited"
                    );
                }
            }

            for (kind, instance) in lingering {
                if unreachable.contains(&kind) {
                    continue;
                }
                ops.push(Operation::Delete {
                    id: instance.id,
                    spec: instance.spec,
                    backend: kind,
                    registration: observations.registration(&instance.id).map(|r| r.id),
                    priority: DeletionPriority::Orphaned,
                });
            }
            for registration in &inventory.orphaned_registrations {
                info!(registration_id = registration.id, name = %registration.name, "Removing orphaned registration");
                ops.push(Operation::DeleteRegistration {
                    registration_id: registration.id,
                });
            }
            ops
        };

        // Execute
        let halted = self.execute(ops, deadline, &mut report).await;
        for kind in halted {
            if let Some(backend_report) = report.backends.get_mut(&kind) {
                backend_report.halted = true;
            }
        }

        // Metrics
        let finished_at = Utc::now();
        let terminated = gate.lock().await.take_terminal(finished_at);
        let records = self.metrics.record_terminated(&terminated, finished_at).await;
        report.terminated = terminated.len() as u32;

        let abnormal: BTreeSet<InstanceId> = records
            .iter()
            .filter(|(_, record)| record.status == OutcomeStatus::Abnormal)
            .map(|(id, _)| *id)
            .collect();
        let mut crashed: BTreeMap<SpecKey, u32> = BTreeMap::new();
        for instance in &terminated {
            if crashed_exit(instance.exit, abnormal.contains(&instance.id)) {
                *crashed.entry(instance.spec.clone()).or_default() += 1;
            }
        }

        let duration = clock.elapsed();
        report.duration_ms = duration.as_millis() as u64;
        report.assess_health();

        let summaries = report
            .specs
            .iter()
            .map(|(key, spec)| ReconciliationMetric {
                timestamp: started_at.timestamp(),
                flavor: key.flavor.clone(),
                crashed_runners: crashed.get(key).copied().unwrap_or(0),
                idle_runners: spec.counts.idle,
                active_runners: spec.counts.busy,
                expected_runners: spec.counts.desired,
                duration: duration.as_secs_f64(),
            })
            .collect();
        self.metrics.record_reconciliation(summaries).await;
        self.metrics.flush().await;

        info!(
            health = ?report.health,
            created = report.created(),
            deleted = report.deleted(),
            failed = report.failed(),
            terminated = report.terminated,
            abandoned = report.abandoned,
            duration_ms = report.duration_ms,
            "Reconciliation pass complete"
        );
        report
    }

    /// Probe pending runners that have not connected yet.
    ///
    /// Returns backends whose status calls failed broadly.
    async fn probe_pending(
        &self,
        observations: &mut Observations,
        unreachable: &BTreeSet<BackendKind>,
        deadline: Instant,
    ) -> BTreeMap<BackendKind, String> {
        let targets: Vec<(InstanceId, BackendKind)> = {
            let ledger = self.provisioner.gate().lock().await;
            ledger
                .instances()
                .filter(|i| i.lifecycle == Lifecycle::Pending && !unreachable.contains(&i.backend))
                .filter(|i| !observations.registration(&i.id).is_some_and(Registration::is_active))
                .map(|i| (i.id, i.backend))
                .collect()
        };
        if targets.is_empty() {
            return BTreeMap::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.worker_concurrency));
        let mut tasks = JoinSet::new();
        for (id, kind) in targets {
            let Some(backend) = self.provisioner.backend(kind).cloned() else {
                continue;
            };
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => backend.status(&id).await,
                    Err(e) => Err(FleetError::unreachable(kind, e)),
                };
                (id, kind, result)
            });
        }

        let mut tallies: BTreeMap<BackendKind, ProbeTally> = BTreeMap::new();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let (id, kind, result) = match joined {
                        Ok(probe) => probe,
                        Err(e) => {
                            error!(error = %e, "Status probe task failed");
                            continue;
                        }
                    };
                    let tally = tallies.entry(kind).or_default();
                    tally.total += 1;
                    match result {
                        Ok(status) => {
                            observations.probes.insert(id, status);
                        }
                        Err(e) if e.is_not_found() => {
                            debug!(instance_id = %id, "Probed runner not found");
                        }
                        Err(e) => {
                            debug!(instance_id = %id, error = %e, "Status probe failed");
                            tally.failed += 1;
                            tally.unreachable |= e.is_backend_wide();
                            if e.is_backend_wide() || tally.error.is_none() {
                                tally.error = Some(e.to_string());
                            }
                        }
                    }
                }
                _ = &mut sleep => {
                    warn!(remaining = tasks.len(), "Pass deadline reached while probing");
                    tasks.detach_all();
                    break;
                }
            }
        }

        tallies
            .into_iter()
            .filter(|(_, tally)| tally.unreachable || probes_failing(tally.total, tally.failed))
            .map(|(kind, tally)| (kind, tally.error.unwrap_or_default()))
            .collect()
    }

    /// Run planned operations on the worker pool.
    ///
    /// Returns backends that were halted by an unreachable error.
    async fn execute(
        &self,
        ops: Vec<Operation>,
        deadline: Instant,
        report: &mut PassReport,
    ) -> BTreeSet<BackendKind> {
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_concurrency));
        let abandoned = Arc::new(AtomicBool::new(false));
        let halted: Arc<Mutex<BTreeSet<BackendKind>>> = Arc::new(Mutex::new(BTreeSet::new()));
        let mut tasks = JoinSet::new();

        for op in ops {
            let provisioner = self.provisioner.clone();
            let semaphore = semaphore.clone();
            let abandoned = abandoned.clone();
            let halted = halted.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    op.discard(&provisioner).await;
                    return OpResult { op, outcome: OpOutcome::Abandoned };
                };
                if abandoned.load(Ordering::SeqCst) {
                    op.discard(&provisioner).await;
                    return OpResult { op, outcome: OpOutcome::Abandoned };
                }
                if op.backend().is_some_and(|b| lock(&halted).contains(&b)) {
                    op.discard(&provisioner).await;
                    return OpResult { op, outcome: OpOutcome::Skipped };
                }
                if let Operation::Create { id, spec } = &op {
                    let mut ledger = provisioner.gate().lock().await;
                    if ledger.is_quarantined(&spec.key(), Utc::now()) {
                        ledger.release(id);
                        drop(ledger);
                        debug!(instance_id = %id, spec = %spec.key(), "Spec quarantined mid-pass, create dropped");
                        return OpResult { op, outcome: OpOutcome::Quarantined };
                    }
                }

                let outcome = match op.apply(&provisioner).await {
                    Ok(()) => OpOutcome::Done,
                    Err(e) => {
                        if e.is_backend_wide() {
                            if let Some(backend) = op.backend() {
                                if lock(&halted).insert(backend) {
                                    warn!(backend = %backend, error = %e, "Backend unreachable, halting mutations for this pass");
                                }
                            }
                        }
                        OpOutcome::Failed(e)
                    }
                };
                OpResult { op, outcome }
            });
        }

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(result) => tally(report, result),
                        Err(e) => error!(error = %e, "Reconciliation task failed"),
                    }
                }
                _ = &mut sleep => {
                    abandoned.store(true, Ordering::SeqCst);
                    let remaining = tasks.len();
                    warn!(remaining, "Pass deadline reached, abandoning remaining work");
                    // Issued calls run to completion in the background
                    tasks.detach_all();
                    report.abandoned += remaining as u32;
                    report.timed_out = true;
                    break;
                }
            }
        }

        let halted = lock(&halted).clone();
        halted
    }

    // -------------------------------------------------------------------------
    // Runner info and flush
    // -------------------------------------------------------------------------

    /// Registration overview for the admin API.
    pub async fn runner_info(&self) -> Result<RunnerInfo> {
        let registrations = self.provisioner.platform().list_registrations().await?;
        let observations = Observations::new(Some(&registrations));
        let mut info = RunnerInfo::default();

        for registration in &registrations {
            if registration.instance_id().is_none() {
                continue;
            }
            if !registration.is_active() {
                info.offline += 1;
            } else if registration.busy {
                info.busy += 1;
                info.busy_runners.push(registration.name.clone());
            } else {
                info.online += 1;
                info.online_runners.push(registration.name.clone());
            }
        }

        let ledger = self.provisioner.gate().lock().await;
        info.unknown = ledger
            .instances()
            .filter(|i| i.lifecycle.is_live() && observations.registration(&i.id).is_none())
            .count() as u32;
        Ok(info)
    }

    /// Delete idle runners, or every runner with [`FlushMode::Busy`].
    ///
    /// Callers serialize flushes with passes.
    pub async fn flush(&self, mode: FlushMode) -> Result<FlushReport> {
        let registrations = self.provisioner.platform().list_registrations().await?;
        let observations = Observations::new(Some(&registrations));

        let victims: Vec<(InstanceId, BackendKind, Option<u64>)> = {
            let ledger = self.provisioner.gate().lock().await;
            ledger
                .instances()
                .filter(|i| i.lifecycle.is_live())
                .filter_map(|i| {
                    let registration = observations.registration(&i.id);
                    let busy = registration.is_some_and(|r| r.busy);
                    (mode == FlushMode::Busy || !busy)
                        .then(|| (i.id, i.backend, registration.map(|r| r.id)))
                })
                .collect()
        };
        info!(mode = ?mode, runners = victims.len(), "Flushing runners");

        let semaphore = Arc::new(Semaphore::new(self.settings.worker_concurrency));
        let mut tasks = JoinSet::new();
        for (id, backend, registration) in victims {
            let provisioner = self.provisioner.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| FleetError::unreachable(backend, e))?;
                provisioner
                    .delete(&id, backend, registration, ExitReason::Flushed)
                    .await
            });
        }

        let mut report = FlushReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => report.deleted += 1,
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "Flush task failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct ProbeTally {
    total: u32,
    failed: u32,
    unreachable: bool,
    error: Option<String>,
}

/// Whether status probe failures mean the backend is down.
///
/// More than half of at least two probes, or every probe, failed.
fn probes_failing(total: u32, failed: u32) -> bool {
    failed > 0 && (failed == total || (total >= 2 && failed * 2 > total))
}

/// Exit reason recorded for a delete of the given class.
fn exit_reason(priority: DeletionPriority) -> ExitReason {
    match priority {
        DeletionPriority::Orphaned => ExitReason::Orphaned,
        DeletionPriority::Unhealthy => ExitReason::Unhealthy,
        DeletionPriority::Idle => ExitReason::Surplus,
    }
}

/// Whether a retired runner counts as crashed.
///
/// Runners that vanished on their own count when their job outcome was
/// abnormal; runners deleted for missing the health timeout always count.
fn crashed_exit(exit: Option<ExitReason>, abnormal: bool) -> bool {
    match exit {
        Some(ExitReason::Unhealthy) => true,
        Some(ExitReason::Vanished) | None => abnormal,
        Some(ExitReason::Surplus | ExitReason::Orphaned | ExitReason::Flushed) => false,
    }
}

fn tally(report: &mut PassReport, result: OpResult) {
    let OpResult { op, outcome } = result;

    if let Operation::DeleteRegistration { .. } = op {
        if matches!(outcome, OpOutcome::Done) {
            report.registrations_deleted += 1;
        }
        return;
    }

    let Some(key) = op.spec() else {
        return;
    };
    let spec = report.specs.entry(key).or_default();
    match (&op, outcome) {
        (Operation::Create { .. }, OpOutcome::Done) => spec.created += 1,
        (Operation::Delete { .. }, OpOutcome::Done) => spec.deleted += 1,
        (_, OpOutcome::Failed(_)) => spec.failed += 1,
        (_, OpOutcome::Skipped) => spec.backend_unavailable = true,
        (_, OpOutcome::Quarantined) => spec.quarantined = true,
        (_, OpOutcome::Abandoned) => report.abandoned += 1,
        _ => {}
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
