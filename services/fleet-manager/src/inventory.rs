//! Per-pass fleet inventory.
//!
//! Rebuilt from the ledger, the health classification and the platform's
//! registration list at the start of every pass and discarded afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use fleet_reconcile::{elapsed, DeletionPriority, Delta};
use serde::Serialize;

use crate::capacity::FleetLedger;
use crate::health::Condition;
use crate::types::{BackendKind, FleetTarget, Registration, SpecKey};

/// One live runner as seen by this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryEntry {
    pub id: InstanceId,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    pub condition: Condition,

    /// Spawned for a specific job rather than the standing pool.
    pub reactive: bool,
}

impl InventoryEntry {
    /// Deletion class, if the runner may be deleted at all.
    ///
    /// Busy and pending runners are never candidates. Idle runners spawned
    /// for a job are kept for that job.
    pub fn deletion_priority(&self) -> Option<DeletionPriority> {
        if let Some(priority) = self.condition.mandatory_deletion() {
            return Some(priority);
        }
        (self.condition == Condition::Idle && !self.reactive).then_some(DeletionPriority::Idle)
    }
}

/// Runner counts for one spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventoryCounts {
    pub desired: u32,
    pub idle: u32,
    pub busy: u32,
    pub pending: u32,
    pub unhealthy: u32,
    pub orphaned_vms: u32,
    pub orphaned_registrations: u32,
    pub reactive: u32,
}

/// Everything this pass knows about one spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecInventory {
    pub desired: u32,
    pub entries: Vec<InventoryEntry>,
    pub orphaned_registrations: u32,
}

impl SpecInventory {
    fn count(&self, condition: Condition) -> u32 {
        self.entries.iter().filter(|e| e.condition == condition).count() as u32
    }

    /// Standing-pool runners that count toward desired.
    pub fn eligible(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| !e.reactive && e.condition.is_eligible())
            .count() as u32
    }

    pub fn delta(&self) -> Delta {
        Delta::compute(self.desired, self.eligible())
    }

    /// Runners that may be selected for deletion this pass.
    pub fn deletion_candidates(&self) -> Vec<(InventoryEntry, DeletionPriority)> {
        self.entries
            .iter()
            .filter_map(|e| e.deletion_priority().map(|p| (e.clone(), p)))
            .collect()
    }

    /// Job runners that have sat idle for longer than `grace`.
    ///
    /// Their job was taken by another runner or cancelled; they are retired
    /// regardless of desired.
    pub fn stale_reactive(&self, now: DateTime<Utc>, grace: Duration) -> Vec<InventoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.reactive && e.condition == Condition::Idle)
            .filter(|e| elapsed(e.created_at, now) > grace)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> InventoryCounts {
        InventoryCounts {
            desired: self.desired,
            idle: self.count(Condition::Idle),
            busy: self.count(Condition::Busy),
            pending: self.count(Condition::Pending),
            unhealthy: self.count(Condition::Unhealthy),
            orphaned_vms: self.count(Condition::OrphanedVm),
            orphaned_registrations: self.orphaned_registrations,
            reactive: self.entries.iter().filter(|e| e.reactive).count() as u32,
        }
    }
}

/// Snapshot of the whole fleet for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetInventory {
    /// Configured specs plus any spec that still has live runners.
    pub specs: BTreeMap<SpecKey, SpecInventory>,

    /// Registrations of ours with no runner behind them.
    pub orphaned_registrations: Vec<Registration>,
}

impl FleetInventory {
    pub fn build(
        target: &FleetTarget,
        ledger: &FleetLedger,
        conditions: &BTreeMap<InstanceId, Condition>,
        orphaned_registrations: Vec<Registration>,
    ) -> Self {
        let mut specs: BTreeMap<SpecKey, SpecInventory> = target
            .specs
            .iter()
            .map(|spec| {
                (
                    spec.key(),
                    SpecInventory {
                        desired: spec.desired,
                        ..SpecInventory::default()
                    },
                )
            })
            .collect();

        for instance in ledger.instances() {
            let Some(condition) = conditions.get(&instance.id) else {
                continue;
            };
            specs
                .entry(instance.spec.clone())
                .or_default()
                .entries
                .push(InventoryEntry {
                    id: instance.id,
                    backend: instance.backend,
                    created_at: instance.created_at,
                    condition: *condition,
                    reactive: instance.is_reactive(),
                });
        }

        for registration in &orphaned_registrations {
            if let Some((_, inventory)) = specs
                .iter_mut()
                .find(|(key, _)| registration_matches(registration, key))
            {
                inventory.orphaned_registrations += 1;
            }
        }

        Self {
            specs,
            orphaned_registrations,
        }
    }

    pub fn spec(&self, key: &SpecKey) -> Option<&SpecInventory> {
        self.specs.get(key)
    }

    pub fn counts(&self) -> BTreeMap<SpecKey, InventoryCounts> {
        self.specs.iter().map(|(k, v)| (k.clone(), v.counts())).collect()
    }
}

fn registration_matches(registration: &Registration, key: &SpecKey) -> bool {
    let has = |wanted: &str| {
        registration
            .labels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(wanted))
    };
    has(&key.flavor) && has(&key.label)
}
