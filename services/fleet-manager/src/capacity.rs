//! Shared fleet ledger and the gate serializing create decisions.
//!
//! The ledger is the single logical view both the reconciler and the reactive
//! consumer decide against. It tracks:
//!
//! - runners known to exist (committed creates and instances adopted from
//!   backend listings)
//! - reservations for creates that are in flight
//! - which dedup key belongs to which runner, and which keys were consumed
//! - per-spec quarantine state
//!
//! Every create is preceded by a reservation taken under the gate lock, and
//! the cap check counts live runners plus reservations. Concurrent callers
//! therefore never oversubscribe the global cap.
//!
//! Commits are stamped with an epoch. A backend listing only proves the
//! absence of runners committed before the listing started, so runners
//! committed while a listing was in progress are never marked terminal by it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{DedupKey, InstanceId};
use fleet_reconcile::{elapsed, QuarantineTracker};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::types::{
    BackendInstance, BackendKind, ExitReason, Lifecycle, RunnerInstance, RunnerSpec, SpecKey,
};

/// A create that has been decided but not yet confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub spec: SpecKey,
    pub backend: BackendKind,
    pub dedup_key: Option<DedupKey>,
}

#[derive(Debug, Clone)]
struct Tracked {
    instance: RunnerInstance,
    epoch: u64,
}

/// Result of asking for on-demand capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Capacity reserved under the returned id; the caller must create it.
    Reserved(InstanceId),

    /// A runner for this dedup key exists or is being created.
    Duplicate(InstanceId),

    /// A runner for this dedup key already ran and is gone.
    Consumed,

    /// Creation for the spec is suspended.
    Quarantined { until: Option<DateTime<Utc>> },

    /// The global cap is exhausted.
    CapReached,
}

/// Changes applied by one backend listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncOutcome {
    /// Runners found on the backend that the ledger did not know about.
    pub adopted: Vec<InstanceId>,

    /// Runners that disappeared from the backend.
    pub terminated: Vec<InstanceId>,

    /// Runners already retired that the backend still lists.
    pub lingering: Vec<InstanceId>,
}

/// Fleet-wide bookkeeping shared by every create decision.
#[derive(Debug)]
pub struct FleetLedger {
    instances: BTreeMap<InstanceId, Tracked>,
    reserved: BTreeMap<InstanceId, Reservation>,
    dedup: BTreeMap<DedupKey, InstanceId>,

    /// Dedup keys whose runner is gone, with the time it went.
    consumed: BTreeMap<DedupKey, DateTime<Utc>>,

    /// Runners already handed to metrics, with the time they were retired.
    retired: BTreeMap<InstanceId, DateTime<Utc>>,

    quarantine: QuarantineTracker<SpecKey>,
    cap: Option<u32>,
    epoch: u64,
    retention: Duration,
}

impl FleetLedger {
    pub fn new(quarantine_threshold: u32, quarantine_window: Duration, retention: Duration) -> Self {
        Self {
            instances: BTreeMap::new(),
            reserved: BTreeMap::new(),
            dedup: BTreeMap::new(),
            consumed: BTreeMap::new(),
            retired: BTreeMap::new(),
            quarantine: QuarantineTracker::new(quarantine_threshold, quarantine_window),
            cap: None,
            epoch: 0,
            retention,
        }
    }

    // -------------------------------------------------------------------------
    // Cap accounting
    // -------------------------------------------------------------------------

    pub fn cap(&self) -> Option<u32> {
        self.cap
    }

    /// Set the global cap. `None` or zero disables it.
    pub fn set_cap(&mut self, cap: Option<u32>) {
        self.cap = cap.filter(|c| *c > 0);
    }

    /// Non-terminal runners plus in-flight creates.
    pub fn occupied(&self) -> u32 {
        let live = self
            .instances
            .values()
            .filter(|t| t.instance.lifecycle.is_live())
            .count();
        (live + self.reserved.len()) as u32
    }

    /// Creates still allowed under the cap; `None` when uncapped.
    pub fn headroom(&self) -> Option<u32> {
        self.cap.map(|cap| cap.saturating_sub(self.occupied()))
    }

    /// Reserve capacity for one create. Returns false when the cap is reached.
    pub fn reserve(&mut self, id: InstanceId, spec: &RunnerSpec, dedup_key: Option<DedupKey>) -> bool {
        if self.headroom() == Some(0) {
            return false;
        }
        if let Some(key) = &dedup_key {
            self.dedup.insert(key.clone(), id);
        }
        self.reserved.insert(
            id,
            Reservation {
                spec: spec.key(),
                backend: spec.backend,
                dedup_key,
            },
        );
        true
    }

    /// Decide an on-demand create for a job.
    pub fn try_admit(&mut self, spec: &RunnerSpec, key: &DedupKey, now: DateTime<Utc>) -> Admission {
        if let Some(id) = self.dedup.get(key) {
            return Admission::Duplicate(*id);
        }
        if self.consumed.contains_key(key) {
            return Admission::Consumed;
        }
        let spec_key = spec.key();
        if self.quarantine.is_quarantined(&spec_key, now) {
            return Admission::Quarantined {
                until: self.quarantine.quarantined_until(&spec_key, now),
            };
        }

        let id = InstanceId::new();
        if self.reserve(id, spec, Some(key.clone())) {
            Admission::Reserved(id)
        } else {
            Admission::CapReached
        }
    }

    /// The backend confirmed a reserved create.
    pub fn commit(&mut self, id: &InstanceId, created_at: DateTime<Utc>) -> Option<&RunnerInstance> {
        let reservation = self.reserved.remove(id)?;
        self.epoch += 1;
        let instance = RunnerInstance {
            id: *id,
            backend: reservation.backend,
            spec: reservation.spec,
            lifecycle: Lifecycle::Pending,
            created_at,
            last_seen: created_at,
            dedup_key: reservation.dedup_key,
            exit: None,
        };
        let tracked = self.instances.entry(*id).or_insert(Tracked {
            instance,
            epoch: self.epoch,
        });
        Some(&tracked.instance)
    }

    /// A reserved create failed or was abandoned before being issued.
    pub fn release(&mut self, id: &InstanceId) -> Option<Reservation> {
        let reservation = self.reserved.remove(id)?;
        if let Some(key) = &reservation.dedup_key {
            if self.dedup.get(key) == Some(id) {
                self.dedup.remove(key);
            }
        }
        Some(reservation)
    }

    pub fn is_reserved(&self, id: &InstanceId) -> bool {
        self.reserved.contains_key(id)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    // -------------------------------------------------------------------------
    // Instances
    // -------------------------------------------------------------------------

    /// Epoch to pass to [`FleetLedger::resync`] for a listing started now.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Merge a successful backend listing into the ledger.
    ///
    /// `listed_epoch` is the value of [`FleetLedger::epoch`] taken before the
    /// listing call was issued.
    pub fn resync(
        &mut self,
        backend: BackendKind,
        listing: &[BackendInstance],
        listed_epoch: u64,
    ) -> ResyncOutcome {
        let mut outcome = ResyncOutcome::default();
        let listed: BTreeSet<InstanceId> = listing.iter().map(|i| i.id).collect();

        for found in listing {
            if self.retired.contains_key(&found.id) {
                outcome.lingering.push(found.id);
                continue;
            }
            if self.instances.contains_key(&found.id) || self.reserved.contains_key(&found.id) {
                continue;
            }

            if let Some(key) = &found.dedup_key {
                self.dedup.entry(key.clone()).or_insert(found.id);
            }
            self.instances.insert(
                found.id,
                Tracked {
                    instance: RunnerInstance {
                        id: found.id,
                        backend,
                        spec: found.spec.clone(),
                        lifecycle: Lifecycle::Pending,
                        created_at: found.created_at,
                        last_seen: found.created_at,
                        dedup_key: found.dedup_key.clone(),
                        exit: None,
                    },
                    epoch: self.epoch,
                },
            );
            debug!(instance_id = %found.id, backend = %backend, "Adopted runner from backend listing");
            outcome.adopted.push(found.id);
        }

        for tracked in self.instances.values_mut() {
            let instance = &mut tracked.instance;
            if instance.backend != backend
                || !instance.lifecycle.is_live()
                || tracked.epoch > listed_epoch
                || listed.contains(&instance.id)
            {
                continue;
            }
            instance.lifecycle = Lifecycle::Terminal;
            instance.exit = Some(ExitReason::Vanished);
            outcome.terminated.push(instance.id);
        }

        outcome
    }

    /// The backend confirmed a delete issued for `reason`.
    pub fn mark_terminal(&mut self, id: &InstanceId, reason: ExitReason) -> bool {
        match self.instances.get_mut(id) {
            Some(tracked) if tracked.instance.lifecycle.is_live() => {
                tracked.instance.lifecycle = Lifecycle::Terminal;
                tracked.instance.exit = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// Remove terminal runners from the ledger.
    ///
    /// Each runner is returned exactly once; its dedup key moves to the
    /// consumed set.
    pub fn take_terminal(&mut self, now: DateTime<Utc>) -> Vec<RunnerInstance> {
        let ids: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, t)| t.instance.lifecycle == Lifecycle::Terminal)
            .map(|(id, _)| *id)
            .collect();

        let mut taken = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(tracked) = self.instances.remove(&id) else {
                continue;
            };
            if let Some(key) = &tracked.instance.dedup_key {
                if self.dedup.get(key) == Some(&id) {
                    self.dedup.remove(key);
                }
                self.consumed.insert(key.clone(), now);
            }
            self.retired.insert(id, now);
            taken.push(tracked.instance);
        }
        taken
    }

    pub fn get(&self, id: &InstanceId) -> Option<&RunnerInstance> {
        self.instances.get(id).map(|t| &t.instance)
    }

    pub fn get_mut(&mut self, id: &InstanceId) -> Option<&mut RunnerInstance> {
        self.instances.get_mut(id).map(|t| &mut t.instance)
    }

    pub fn instances(&self) -> impl Iterator<Item = &RunnerInstance> {
        self.instances.values().map(|t| &t.instance)
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut RunnerInstance> {
        self.instances.values_mut().map(|t| &mut t.instance)
    }

    /// Whether `id` is a runner this manager knows: tracked, in flight or
    /// recently retired.
    pub fn knows(&self, id: &InstanceId) -> bool {
        self.instances.contains_key(id)
            || self.reserved.contains_key(id)
            || self.retired.contains_key(id)
    }

    pub fn is_retired(&self, id: &InstanceId) -> bool {
        self.retired.contains_key(id)
    }

    // -------------------------------------------------------------------------
    // Dedup
    // -------------------------------------------------------------------------

    /// Runner created for a dedup key, if one exists or is in flight.
    pub fn lookup_dedup(&self, key: &DedupKey) -> Option<InstanceId> {
        self.dedup.get(key).copied()
    }

    pub fn is_consumed(&self, key: &DedupKey) -> bool {
        self.consumed.contains_key(key)
    }

    /// Forget consumed keys and retired runners past the retention window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let retention = self.retention;
        self.consumed.retain(|_, at| elapsed(*at, now) < retention);
        self.retired.retain(|_, at| elapsed(*at, now) < retention);
        self.quarantine.prune(now);
    }

    // -------------------------------------------------------------------------
    // Quarantine
    // -------------------------------------------------------------------------

    pub fn quarantine(&self) -> &QuarantineTracker<SpecKey> {
        &self.quarantine
    }

    pub fn quarantine_mut(&mut self) -> &mut QuarantineTracker<SpecKey> {
        &mut self.quarantine
    }

    pub fn is_quarantined(&self, spec: &SpecKey, now: DateTime<Utc>) -> bool {
        self.quarantine.is_quarantined(spec, now)
    }

    /// Record a failed create. Returns true if the spec became quarantined.
    pub fn record_create_failure(&mut self, spec: &SpecKey, now: DateTime<Utc>) -> bool {
        let newly = self.quarantine.record_failure(spec, now);
        if newly {
            warn!(
                spec = %spec,
                threshold = self.quarantine.threshold(),
                window_secs = self.quarantine.window().as_secs(),
                "Spec quarantined after repeated create failures"
            );
        }
        newly
    }

    pub fn record_create_success(&mut self, spec: &SpecKey) {
        if self.quarantine.get(spec).is_some() {
            info!(spec = %spec, "Create succeeded, failure streak cleared");
        }
        self.quarantine.record_success(spec);
    }
}

/// Mutual exclusion around the ledger.
///
/// Every create decision, from the reconciler or the reactive consumer, is
/// taken while holding this lock.
pub struct CapacityGate {
    ledger: Mutex<FleetLedger>,
}

impl CapacityGate {
    pub fn new(ledger: FleetLedger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, FleetLedger> {
        self.ledger.lock().await
    }

    pub async fn commit(&self, id: &InstanceId, created_at: DateTime<Utc>) {
        if self.lock().await.commit(id, created_at).is_none() {
            warn!(instance_id = %id, "Commit for unknown reservation");
        }
    }

    pub async fn release(&self, id: &InstanceId) {
        self.lock().await.release(id);
    }

    pub async fn mark_terminal(&self, id: &InstanceId, reason: ExitReason) -> bool {
        self.lock().await.mark_terminal(id, reason)
    }

    pub async fn set_cap(&self, cap: Option<u32>) {
        self.lock().await.set_cap(cap);
    }
}
