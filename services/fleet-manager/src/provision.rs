//! Runner creation and deletion.
//!
//! Shared by the reconciler and the reactive consumer. A create always runs
//! against a reservation taken on the capacity gate and settles it: committed
//! on success, released on failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use fleet_id::{DedupKey, InstanceId};
use tracing::{debug, info, warn};

use crate::backend::{Backend, CreateRequest};
use crate::capacity::CapacityGate;
use crate::error::{FleetError, Result};
use crate::platform::Platform;
use crate::types::{BackendKind, ExitReason, RunnerSpec};

/// Creates and deletes runners across backends.
pub struct Provisioner {
    backends: BTreeMap<BackendKind, Arc<dyn Backend>>,
    platform: Arc<dyn Platform>,
    gate: Arc<CapacityGate>,
}

impl Provisioner {
    pub fn new(
        backends: BTreeMap<BackendKind, Arc<dyn Backend>>,
        platform: Arc<dyn Platform>,
        gate: Arc<CapacityGate>,
    ) -> Self {
        Self {
            backends,
            platform,
            gate,
        }
    }

    pub fn backend(&self, kind: BackendKind) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&kind)
    }

    pub fn backends(&self) -> &BTreeMap<BackendKind, Arc<dyn Backend>> {
        &self.backends
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn gate(&self) -> &Arc<CapacityGate> {
        &self.gate
    }

    /// Create the runner reserved under `id`.
    ///
    /// The runner is registered with the platform first so that it can pick
    /// up a job as soon as it boots. If the VM cannot be created the
    /// registration is removed again.
    pub async fn create(
        &self,
        id: InstanceId,
        spec: &RunnerSpec,
        dedup_key: Option<DedupKey>,
    ) -> Result<InstanceId> {
        let Some(backend) = self.backends.get(&spec.backend) else {
            self.gate.release(&id).await;
            return Err(FleetError::unreachable(spec.backend, "backend not configured"));
        };

        let token = match self.platform.registration_token(&id, spec).await {
            Ok(token) => token,
            Err(e) => {
                self.gate.release(&id).await;
                warn!(instance_id = %id, spec = %spec.key(), error = %e, "Failed to obtain registration token");
                return Err(e);
            }
        };

        let request = CreateRequest {
            id,
            spec: spec.clone(),
            dedup_key,
            jit_config: token.jit_config,
            created_at: Utc::now(),
        };

        match backend.create(&request).await {
            Ok(created) => {
                let mut ledger = self.gate.lock().await;
                ledger.commit(&id, request.created_at);
                ledger.record_create_success(&spec.key());
                drop(ledger);

                info!(
                    instance_id = %created,
                    spec = %spec.key(),
                    backend = %spec.backend,
                    dedup_key = ?request.dedup_key.as_ref().map(|k| k.as_str()),
                    "Runner created"
                );
                Ok(created)
            }
            Err(e) => {
                if let Some(runner_id) = token.runner_id {
                    if let Err(cleanup) = self.platform.delete_registration(runner_id).await {
                        warn!(
                            instance_id = %id,
                            registration_id = runner_id,
                            error = %cleanup,
                            "Failed to remove registration of failed runner"
                        );
                    }
                }

                let mut ledger = self.gate.lock().await;
                ledger.release(&id);
                if e.counts_toward_quarantine() {
                    ledger.record_create_failure(&spec.key(), Utc::now());
                }
                drop(ledger);

                warn!(instance_id = %id, spec = %spec.key(), error = %e, "Runner create failed");
                Err(e)
            }
        }
    }

    /// Delete a runner and its registration.
    ///
    /// A runner that is already gone counts as deleted. `reason` is recorded on
    /// the runner for outcome reporting.
    pub async fn delete(
        &self,
        id: &InstanceId,
        backend: BackendKind,
        registration: Option<u64>,
        reason: ExitReason,
    ) -> Result<()> {
        let Some(client) = self.backends.get(&backend) else {
            return Err(FleetError::unreachable(backend, "backend not configured"));
        };

        match client.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(instance_id = %id, "Runner already gone");
            }
            Err(e) => {
                warn!(instance_id = %id, backend = %backend, error = %e, "Runner delete failed");
                return Err(e);
            }
        }

        self.gate.mark_terminal(id, reason).await;
        info!(instance_id = %id, backend = %backend, reason = ?reason, "Runner deleted");

        if let Some(registration_id) = registration {
            self.delete_registration(registration_id).await;
        }
        Ok(())
    }

    /// Remove a registration. Failures are logged; leftover registrations are
    /// collected as orphans on a later pass.
    pub async fn delete_registration(&self, registration_id: u64) -> bool {
        match self.platform.delete_registration(registration_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(registration_id, error = %e, "Failed to delete registration");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::capacity::FleetLedger;
    use crate::platform::MockPlatform;
    use crate::types::{Lifecycle, SpecKey};
    use std::time::Duration;

    struct Fixture {
        backend: Arc<MockBackend>,
        platform: Arc<MockPlatform>,
        gate: Arc<CapacityGate>,
        provisioner: Provisioner,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let platform = Arc::new(MockPlatform::new());
        let gate = Arc::new(CapacityGate::new(FleetLedger::new(
            2,
            Duration::from_secs(600),
            Duration::from_secs(3600),
        )));
        let mut backends: BTreeMap<BackendKind, Arc<dyn Backend>> = BTreeMap::new();
        backends.insert(BackendKind::Mock, backend.clone());
        let provisioner = Provisioner::new(backends, platform.clone(), gate.clone());
        Fixture {
            backend,
            platform,
            gate,
            provisioner,
        }
    }

    fn spec() -> RunnerSpec {
        RunnerSpec {
            flavor: "small".to_string(),
            label: "x64".to_string(),
            image: "noble".to_string(),
            desired: 1,
            backend: BackendKind::Mock,
        }
    }

    async fn reserve(gate: &CapacityGate) -> InstanceId {
        let id = InstanceId::new();
        assert!(gate.lock().await.reserve(id, &spec(), None));
        id
    }

    #[tokio::test]
    async fn test_create_commits_reservation() {
        let f = fixture();
        let id = reserve(&f.gate).await;

        f.provisioner.create(id, &spec(), None).await.unwrap();

        let ledger = f.gate.lock().await;
        assert!(!ledger.is_reserved(&id));
        assert_eq!(ledger.get(&id).unwrap().lifecycle, Lifecycle::Pending);
        assert!(f.backend.contains(&id));
        assert!(f.platform.registration_names().contains(&id.to_string()));
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back_registration() {
        let f = fixture();
        f.backend.set_create_error(Some(FleetError::Provision("bad image".into())));
        let id = reserve(&f.gate).await;

        assert!(f.provisioner.create(id, &spec(), None).await.is_err());

        let ledger = f.gate.lock().await;
        assert!(!ledger.is_reserved(&id));
        assert!(ledger.get(&id).is_none());
        assert!(f.platform.registration_names().is_empty());
        assert_eq!(
            ledger.quarantine().get(&SpecKey::new("small", "x64")).unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_platform_failure_does_not_count_toward_quarantine() {
        let f = fixture();
        f.platform
            .set_token_error(Some(FleetError::PlatformUnavailable("503".into())));
        let id = reserve(&f.gate).await;

        assert!(f.provisioner.create(id, &spec(), None).await.is_err());
        assert_eq!(f.backend.create_calls(), 0);
        let ledger = f.gate.lock().await;
        assert_eq!(ledger.reserved_count(), 0);
        assert!(ledger.quarantine().get(&SpecKey::new("small", "x64")).is_none());
    }

    #[tokio::test]
    async fn test_delete_marks_terminal() {
        let f = fixture();
        let id = reserve(&f.gate).await;
        f.provisioner.create(id, &spec(), None).await.unwrap();

        f.provisioner
            .delete(&id, BackendKind::Mock, Some(1), ExitReason::Surplus)
            .await
            .unwrap();
        assert!(!f.backend.contains(&id));
        assert_eq!(
            f.gate.lock().await.get(&id).unwrap().lifecycle,
            Lifecycle::Terminal
        );
        assert_eq!(
            f.gate.lock().await.get(&id).unwrap().exit,
            Some(ExitReason::Surplus)
        );
        assert_eq!(f.platform.delete_calls(), 1);

        // Deleting again is a no-op
        f.provisioner
            .delete(&id, BackendKind::Mock, None, ExitReason::Flushed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_runner_live() {
        let f = fixture();
        let id = reserve(&f.gate).await;
        f.provisioner.create(id, &spec(), None).await.unwrap();
        f.backend
            .set_delete_error(Some(FleetError::unreachable(BackendKind::Mock, "down")));

        assert!(f
            .provisioner
            .delete(&id, BackendKind::Mock, None, ExitReason::Surplus)
            .await
            .is_err());
        assert_eq!(
            f.gate.lock().await.get(&id).unwrap().lifecycle,
            Lifecycle::Pending
        );
    }
}
