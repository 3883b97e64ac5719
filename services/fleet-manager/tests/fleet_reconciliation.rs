//! Integration tests for reconciliation passes.
//!
//! Each test drives the reconciler against a mock backend and a mock CI
//! platform and checks the resulting fleet:
//! 1. Convergence to the desired shape and idempotence once converged
//! 2. Surplus, orphan and stuck runner cleanup
//! 3. Quarantine of failing specs
//! 4. Backend outage isolation
//! 5. Exactly-once outcome metrics

mod harness;

use std::sync::Arc;
use std::time::Duration;

use fleet_events::{JobOutcomeRecord, MetricEvent, OutcomeStatus, StatusInfo, UNKNOWN_STATUS_CODE};
use fleet_manager::backend::MockBackend;
use fleet_manager::error::FleetError;
use fleet_manager::types::{BackendKind, RegistrationStatus, SpecKey, VmStatus};
use fleet_reconcile::PassHealth;
use harness::{existing_vm, old_instance_id, spec, target, Harness, HarnessBuilder};

fn small() -> SpecKey {
    SpecKey::new("small", "x64")
}

// =============================================================================
// Convergence
// =============================================================================

#[tokio::test]
async fn test_converges_then_idle() {
    let h = Harness::new(target(vec![spec("small", 3)], None));

    let report = h.pass().await;
    assert_eq!(report.health, PassHealth::Healthy);
    assert_eq!(report.created(), 3);
    assert_eq!(h.backend.len(), 3);
    assert_eq!(h.platform.registration_names().len(), 3);

    let report = h.pass().await;
    assert_eq!(report.created(), 0);
    assert_eq!(report.deleted(), 0);
    assert_eq!(report.spec(&small()).unwrap().counts.idle, 3);
    assert_eq!(h.backend.create_calls(), 3);
    assert_eq!(h.backend.delete_calls(), 0);
}

#[tokio::test]
async fn test_surplus_deletes_oldest_idle_runners() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    let s = spec("small", 1);

    let oldest = existing_vm(&h.backend, &s, Duration::from_secs(3 * 3600), VmStatus::Active);
    let older = existing_vm(&h.backend, &s, Duration::from_secs(2 * 3600), VmStatus::Active);
    let newest = existing_vm(&h.backend, &s, Duration::from_secs(3600), VmStatus::Active);
    for id in [oldest, older, newest] {
        h.platform.register(&id.to_string(), RegistrationStatus::Online, false);
    }

    let report = h.pass().await;
    assert_eq!(report.backends[&BackendKind::Mock].adopted, 3);
    assert_eq!(report.deleted(), 2);
    assert_eq!(report.created(), 0);

    assert!(h.backend.contains(&newest));
    assert!(!h.backend.contains(&oldest));
    assert!(!h.backend.contains(&older));
    assert_eq!(
        h.platform.registration_names().into_iter().collect::<Vec<_>>(),
        vec![newest.to_string()]
    );
}

#[tokio::test]
async fn test_busy_runners_survive_scale_down() {
    let h = Harness::new(target(vec![spec("small", 0)], None));
    let s = spec("small", 0);

    let busy = existing_vm(&h.backend, &s, Duration::from_secs(3600), VmStatus::Active);
    h.platform.register(&busy.to_string(), RegistrationStatus::Online, true);

    let report = h.pass().await;
    assert_eq!(report.deleted(), 0);
    assert_eq!(report.spec(&small()).unwrap().counts.busy, 1);
    assert!(h.backend.contains(&busy));
}

// =============================================================================
// Cleanup
// =============================================================================

#[tokio::test]
async fn test_orphaned_vm_is_replaced() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    let orphan = existing_vm(
        &h.backend,
        &spec("small", 1),
        Duration::from_secs(3600),
        VmStatus::Active,
    );

    let report = h.pass().await;
    assert_eq!(report.spec(&small()).unwrap().counts.orphaned_vms, 1);
    assert_eq!(report.deleted(), 1);
    assert_eq!(report.created(), 1);
    assert!(!h.backend.contains(&orphan));
    assert_eq!(h.backend.len(), 1);
}

#[tokio::test]
async fn test_orphaned_registration_removed() {
    let h = Harness::new(target(vec![spec("small", 0)], None));

    let gone = old_instance_id(Duration::from_secs(3600));
    h.platform.register(&gone.to_string(), RegistrationStatus::Offline, false);
    h.platform.register("build-box-7", RegistrationStatus::Online, false);

    let report = h.pass().await;
    assert_eq!(report.registrations_deleted, 1);
    assert_eq!(
        h.platform.registration_names().into_iter().collect::<Vec<_>>(),
        vec!["build-box-7".to_string()]
    );
}

#[tokio::test]
async fn test_fresh_registration_not_orphaned() {
    let h = Harness::new(target(vec![spec("small", 0)], None));

    let booting = old_instance_id(Duration::from_secs(30));
    h.platform.register(&booting.to_string(), RegistrationStatus::Offline, false);

    let report = h.pass().await;
    assert_eq!(report.registrations_deleted, 0);
    assert!(h.platform.registration_names().contains(&booting.to_string()));
}

#[tokio::test]
async fn test_stuck_runner_replaced() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    let stuck = existing_vm(
        &h.backend,
        &spec("small", 1),
        Duration::from_secs(30 * 60),
        VmStatus::Provisioning,
    );
    h.platform.register(&stuck.to_string(), RegistrationStatus::Offline, false);

    let report = h.pass().await;
    assert_eq!(report.spec(&small()).unwrap().counts.unhealthy, 1);
    assert_eq!(report.deleted(), 1);
    assert_eq!(report.created(), 1);
    assert!(!h.backend.contains(&stuck));
    assert_eq!(h.backend.len(), 1);
}

#[tokio::test]
async fn test_platform_outage_keeps_unregistered_runners() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    let unregistered = existing_vm(
        &h.backend,
        &spec("small", 1),
        Duration::from_secs(3600),
        VmStatus::Active,
    );
    h.platform
        .set_list_error(Some(FleetError::PlatformUnavailable("503".into())));

    let report = h.pass().await;
    assert_eq!(report.health, PassHealth::Degraded);
    assert_eq!(report.deleted(), 0);
    assert!(h.backend.contains(&unregistered));
}

// =============================================================================
// Quarantine
// =============================================================================

#[tokio::test]
async fn test_failing_spec_quarantined_until_changed() {
    let h = HarnessBuilder::new(target(vec![spec("small", 5)], None))
        .worker_concurrency(1)
        .build();
    h.backend
        .fail_next_creates(FleetError::Provision("image missing".into()), 3);

    // Creates still queued when the threshold trips are dropped
    let report = h.pass().await;
    let small_report = report.spec(&small()).unwrap();
    assert_eq!(small_report.planned_creates, 5);
    assert_eq!(report.failed(), 3);
    assert!(small_report.quarantined);
    assert_eq!(h.backend.create_calls(), 3);
    assert!(h.backend.is_empty());
    assert_eq!(h.gate.lock().await.reserved_count(), 0);

    let report = h.pass().await;
    let small_report = report.spec(&small()).unwrap();
    assert!(small_report.quarantined);
    assert_eq!(small_report.planned_creates, 0);
    assert_eq!(report.health, PassHealth::Degraded);
    assert_eq!(h.backend.create_calls(), 3);

    let mut changed = spec("small", 5);
    changed.image = "noble-fixed".to_string();
    h.target.send_replace(target(vec![changed], None));

    let report = h.pass().await;
    assert!(!report.spec(&small()).unwrap().quarantined);
    assert_eq!(report.created(), 5);
    assert_eq!(h.backend.len(), 5);
}

#[tokio::test]
async fn test_quarantine_does_not_block_other_specs() {
    let failing = Arc::new(MockBackend::failing());
    let local = Arc::new(MockBackend::with_kind(BackendKind::Local));

    let mut large = spec("large", 2);
    large.backend = BackendKind::Local;
    let h = HarnessBuilder::new(target(vec![spec("small", 3), large], None))
        .backend(BackendKind::Mock, failing.clone())
        .backend(BackendKind::Local, local.clone())
        .build();

    let report = h.pass().await;
    assert_eq!(report.spec(&small()).unwrap().failed, 3);
    assert_eq!(local.len(), 2);

    local.terminate(&local.instances()[0].id);
    let report = h.pass().await;
    assert!(report.spec(&small()).unwrap().quarantined);
    assert_eq!(report.spec(&SpecKey::new("large", "x64")).unwrap().created, 1);
    assert_eq!(failing.create_calls(), 3);
    assert_eq!(local.len(), 2);
}

// =============================================================================
// Backend Isolation
// =============================================================================

#[tokio::test]
async fn test_backend_outage_isolated() {
    let mock = Arc::new(MockBackend::new());
    let local = Arc::new(MockBackend::with_kind(BackendKind::Local));
    local.set_list_error(Some(FleetError::unreachable(BackendKind::Local, "socket refused")));

    let mut large = spec("large", 2);
    large.backend = BackendKind::Local;
    let h = HarnessBuilder::new(target(vec![spec("small", 2), large], None))
        .backend(BackendKind::Mock, mock.clone())
        .backend(BackendKind::Local, local.clone())
        .build();

    let report = h.pass().await;
    assert_eq!(report.health, PassHealth::Degraded);
    assert!(!report.backends[&BackendKind::Local].reachable);
    assert!(report.backends[&BackendKind::Mock].reachable);

    assert_eq!(report.spec(&small()).unwrap().created, 2);
    assert!(report.spec(&SpecKey::new("large", "x64")).unwrap().backend_unavailable);
    assert_eq!(mock.len(), 2);
    assert_eq!(local.create_calls(), 0);
}

#[tokio::test]
async fn test_backend_outage_keeps_registrations() {
    let h = Harness::new(target(vec![spec("small", 0)], None));
    let gone = old_instance_id(Duration::from_secs(3600));
    h.platform.register(&gone.to_string(), RegistrationStatus::Offline, false);
    h.backend
        .set_list_error(Some(FleetError::unreachable(BackendKind::Mock, "timeout")));

    let report = h.pass().await;
    assert_eq!(report.health, PassHealth::Blocked);
    assert_eq!(report.registrations_deleted, 0);
    assert!(h.platform.registration_names().contains(&gone.to_string()));
}

// =============================================================================
// Outcome Metrics
// =============================================================================

#[tokio::test]
async fn test_outcome_emitted_exactly_once() {
    let h = Harness::new(target(vec![spec("small", 2)], None));
    h.pass().await;

    let ids: Vec<_> = h.backend.instances().into_iter().map(|i| i.id).collect();
    assert_eq!(ids.len(), 2);
    let (reported, silent) = (ids[0], ids[1]);

    let record = JobOutcomeRecord {
        timestamp: 1_760_000_000,
        status: OutcomeStatus::Normal,
        status_info: StatusInfo { code: 0 },
    };
    h.exchange
        .put(reported, serde_json::to_vec(&record).unwrap());
    h.backend.terminate(&reported);
    h.backend.terminate(&silent);

    let report = h.pass().await;
    assert_eq!(report.terminated, 2);
    assert_eq!(report.created(), 2);

    let outcomes = h.sink.outcomes();
    assert_eq!(outcomes.len(), 2);
    let find = |id| {
        outcomes
            .iter()
            .find(|(outcome_id, _)| *outcome_id == id)
            .map(|(_, record)| record.clone())
            .unwrap()
    };
    assert_eq!(find(reported), record);
    let unknown = find(silent);
    assert_eq!(unknown.status, OutcomeStatus::Abnormal);
    assert_eq!(unknown.status_info.code, UNKNOWN_STATUS_CODE);
    assert!(!h.exchange.contains(&reported));

    h.pass().await;
    h.pass().await;
    assert_eq!(h.sink.outcomes().len(), 2);
}

fn crashed_runners(h: &Harness) -> Vec<u32> {
    h.sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            MetricEvent::Reconciliation(metric) => Some(metric.crashed_runners),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_crashed_runners_reported() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    h.pass().await;
    let id = h.backend.instances()[0].id;
    h.backend.terminate(&id);

    h.pass().await;
    assert_eq!(crashed_runners(&h), vec![0, 1]);
}

#[tokio::test]
async fn test_scale_down_is_not_a_crash() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    h.pass().await;
    assert_eq!(h.backend.len(), 1);

    h.target.send_replace(target(vec![spec("small", 0)], None));
    let report = h.pass().await;
    assert_eq!(report.deleted(), 1);
    assert_eq!(report.terminated, 1);

    // The deleted runner still gets its outcome
    assert_eq!(h.sink.outcomes().len(), 1);
    assert_eq!(crashed_runners(&h), vec![0, 0]);
}

#[tokio::test]
async fn test_unhealthy_runner_counted_once() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    let stuck = existing_vm(
        &h.backend,
        &spec("small", 1),
        Duration::from_secs(30 * 60),
        VmStatus::Provisioning,
    );
    h.platform.register(&stuck.to_string(), RegistrationStatus::Offline, false);

    let report = h.pass().await;
    assert_eq!(report.spec(&small()).unwrap().counts.unhealthy, 1);
    assert_eq!(report.terminated, 1);
    assert_eq!(crashed_runners(&h), vec![1]);
}

#[tokio::test]
async fn test_sink_failure_retried_without_duplicates() {
    let h = Harness::new(target(vec![spec("small", 1)], None));
    h.pass().await;
    let id = h.backend.instances()[0].id;
    h.backend.terminate(&id);

    h.sink.set_failing(true);
    let report = h.pass().await;
    assert_eq!(report.terminated, 1);
    assert!(h.sink.outcomes().is_empty());

    h.sink.set_failing(false);
    h.pass().await;
    h.pass().await;

    let outcomes = h.sink.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, id);
}
