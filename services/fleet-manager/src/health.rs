//! Runner health classification.
//!
//! Runners never report completion. A runner is active once it is seen
//! running or connected to the platform, unhealthy once it shows no activity
//! for the health timeout, and terminal once the backend stops listing it.
//!
//! Activity means an online registration. A VM that boots but never
//! registers therefore turns unhealthy after the timeout even if the backend
//! keeps reporting it as running.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use fleet_reconcile::{elapsed, DeletionPriority};
use serde::Serialize;
use tracing::{info, warn};

use crate::capacity::FleetLedger;
use crate::types::{Lifecycle, Registration, RunnerInstance, VmStatus};

/// How a live runner is counted for this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Not yet seen running or registered.
    Pending,

    /// Registered and waiting for a job.
    Idle,

    /// Registered and executing a job.
    Busy,

    /// No activity within the health timeout.
    Unhealthy,

    /// VM without a platform registration past the orphan grace period.
    OrphanedVm,
}

impl Condition {
    /// Deletion class for conditions that are always removed.
    pub fn mandatory_deletion(&self) -> Option<DeletionPriority> {
        match self {
            Condition::OrphanedVm => Some(DeletionPriority::Orphaned),
            Condition::Unhealthy => Some(DeletionPriority::Unhealthy),
            _ => None,
        }
    }

    /// Whether the runner counts toward the standing pool.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Condition::Pending | Condition::Idle | Condition::Busy)
    }
}

/// What the monitor saw for the fleet during one pass.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    /// Registrations keyed by runner. `None` when the platform could not be
    /// listed this pass.
    pub registrations: Option<BTreeMap<InstanceId, Registration>>,

    /// Backend status probes that succeeded this pass.
    pub probes: BTreeMap<InstanceId, VmStatus>,
}

impl Observations {
    pub fn new(registrations: Option<&[Registration]>) -> Self {
        Self {
            registrations: registrations.map(|regs| {
                regs.iter()
                    .filter_map(|r| r.instance_id().map(|id| (id, r.clone())))
                    .collect()
            }),
            probes: BTreeMap::new(),
        }
    }

    pub fn registration(&self, id: &InstanceId) -> Option<&Registration> {
        self.registrations.as_ref().and_then(|regs| regs.get(id))
    }

    pub fn platform_known(&self) -> bool {
        self.registrations.is_some()
    }
}

/// Lifecycle transitions and classification for tracked runners.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    timeout: Duration,
    orphan_grace: Duration,
}

impl HealthMonitor {
    pub fn new(timeout: Duration, orphan_grace: Duration) -> Self {
        Self {
            timeout,
            orphan_grace,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn orphan_grace(&self) -> Duration {
        self.orphan_grace
    }

    /// Advance one runner's lifecycle from what was observed.
    ///
    /// Without a registration view no runner is declared unhealthy, since
    /// absence of activity cannot be told apart from absence of data.
    pub fn observe(
        &self,
        instance: &mut RunnerInstance,
        registration: Option<&Registration>,
        platform_known: bool,
        probe: Option<VmStatus>,
        now: DateTime<Utc>,
    ) {
        let connected = registration.is_some_and(|r| r.is_active());
        if connected {
            instance.last_seen = now;
        }
        let observed = connected || probe == Some(VmStatus::Active);

        let next = match instance.lifecycle {
            Lifecycle::Pending if observed => Lifecycle::Active,
            Lifecycle::Pending
                if platform_known && elapsed(instance.created_at, now) > self.timeout =>
            {
                Lifecycle::Unhealthy
            }
            Lifecycle::Active
                if platform_known && elapsed(instance.last_seen, now) > self.timeout =>
            {
                Lifecycle::Unhealthy
            }
            Lifecycle::Unhealthy if connected => Lifecycle::Active,
            current => current,
        };

        if next == instance.lifecycle {
            return;
        }
        match next {
            Lifecycle::Unhealthy => warn!(
                instance_id = %instance.id,
                spec = %instance.spec,
                from = ?instance.lifecycle,
                last_seen = %instance.last_seen,
                "Runner unhealthy"
            ),
            _ => info!(
                instance_id = %instance.id,
                spec = %instance.spec,
                from = ?instance.lifecycle,
                to = ?next,
                "Runner lifecycle changed"
            ),
        }
        instance.lifecycle = next;
    }

    /// Classify a live runner for inventory and deletion planning.
    pub fn classify(
        &self,
        instance: &RunnerInstance,
        registration: Option<&Registration>,
        platform_known: bool,
        now: DateTime<Utc>,
    ) -> Condition {
        if platform_known
            && registration.is_none()
            && elapsed(instance.created_at, now) > self.orphan_grace
        {
            return Condition::OrphanedVm;
        }
        match instance.lifecycle {
            Lifecycle::Unhealthy => Condition::Unhealthy,
            Lifecycle::Pending => Condition::Pending,
            _ if registration.is_some_and(|r| r.busy) => Condition::Busy,
            _ => Condition::Idle,
        }
    }

    /// Observe and classify every live runner in the ledger.
    pub fn assess(
        &self,
        ledger: &mut FleetLedger,
        observations: &Observations,
        now: DateTime<Utc>,
    ) -> BTreeMap<InstanceId, Condition> {
        let platform_known = observations.platform_known();
        let mut conditions = BTreeMap::new();

        for instance in ledger.instances_mut() {
            if !instance.lifecycle.is_live() {
                continue;
            }
            let registration = observations.registration(&instance.id);
            let probe = observations.probes.get(&instance.id).copied();
            self.observe(instance, registration, platform_known, probe, now);

            let condition = self.classify(instance, registration, platform_known, now);
            if condition == Condition::OrphanedVm {
                warn!(
                    instance_id = %instance.id,
                    spec = %instance.spec,
                    "Runner has no registration past the grace period"
                );
            }
            conditions.insert(instance.id, condition);
        }
        conditions
    }

    /// Registrations of ours with no runner behind them.
    ///
    /// Registrations for in-flight creates are never reported.
    pub fn orphaned_registrations(
        &self,
        ledger: &FleetLedger,
        registrations: &[Registration],
        now: DateTime<Utc>,
    ) -> Vec<Registration> {
        registrations
            .iter()
            .filter(|reg| {
                let Some(id) = reg.instance_id() else {
                    return false;
                };
                let backed = match ledger.get(&id) {
                    Some(instance) => instance.lifecycle.is_live(),
                    None => ledger.is_reserved(&id),
                };
                !backed && registration_age(&id, now) > self.orphan_grace
            })
            .cloned()
            .collect()
    }
}

fn registration_age(id: &InstanceId, now: DateTime<Utc>) -> Duration {
    DateTime::from_timestamp_millis(id.timestamp_ms() as i64)
        .map_or(Duration::ZERO, |minted| elapsed(minted, now))
}
