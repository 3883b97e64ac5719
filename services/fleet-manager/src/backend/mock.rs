//! In-memory backend for development and testing.
//!
//! Keeps VMs in a map, counts calls, and can be told to fail.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::InstanceId;
use tracing::{debug, info};

use super::{Backend, CreateRequest};
use crate::error::{FleetError, Result};
use crate::types::{BackendInstance, BackendKind, VmStatus};

#[derive(Debug, Clone)]
struct MockVm {
    instance: BackendInstance,
    status: VmStatus,
}

/// Mock backend for testing and development.
pub struct MockBackend {
    kind: BackendKind,
    vms: Mutex<BTreeMap<InstanceId, MockVm>>,

    /// Errors returned by upcoming creates, in order.
    create_failures: Mutex<VecDeque<FleetError>>,

    /// Error returned by every create while set.
    create_error: Mutex<Option<FleetError>>,
    list_error: Mutex<Option<FleetError>>,
    status_error: Mutex<Option<FleetError>>,
    delete_error: Mutex<Option<FleetError>>,

    /// Simulated provisioning latency.
    create_delay: Duration,

    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    status_calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::with_kind(BackendKind::Mock)
    }

    /// Create a mock that reports itself as another backend kind.
    pub fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            vms: Mutex::new(BTreeMap::new()),
            create_failures: Mutex::new(VecDeque::new()),
            create_error: Mutex::new(None),
            list_error: Mutex::new(None),
            status_error: Mutex::new(None),
            delete_error: Mutex::new(None),
            create_delay: Duration::ZERO,
            create_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            status_calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Create a mock backend that fails all creates.
    pub fn failing() -> Self {
        let backend = Self::new();
        backend.set_create_error(Some(FleetError::Provision(
            "mock backend configured to fail".to_string(),
        )));
        backend
    }

    /// Add simulated latency to every create.
    #[must_use]
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn fail_next_creates(&self, error: FleetError, count: usize) {
        let mut failures = lock(&self.create_failures);
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    pub fn set_create_error(&self, error: Option<FleetError>) {
        *lock(&self.create_error) = error;
    }

    pub fn set_list_error(&self, error: Option<FleetError>) {
        *lock(&self.list_error) = error;
    }

    pub fn set_status_error(&self, error: Option<FleetError>) {
        *lock(&self.status_error) = error;
    }

    pub fn set_delete_error(&self, error: Option<FleetError>) {
        *lock(&self.delete_error) = error;
    }

    /// Place a VM directly, bypassing `create`.
    pub fn insert(&self, instance: BackendInstance, status: VmStatus) {
        let mut vms = lock(&self.vms);
        vms.insert(instance.id, MockVm { instance, status });
        self.high_water.fetch_max(vms.len(), Ordering::SeqCst);
    }

    /// Simulate a runner shutting itself down after its job.
    pub fn terminate(&self, id: &InstanceId) -> bool {
        lock(&self.vms).remove(id).is_some()
    }

    pub fn set_status(&self, id: &InstanceId, status: VmStatus) {
        if let Some(vm) = lock(&self.vms).get_mut(id) {
            vm.status = status;
        }
    }

    pub fn instances(&self) -> Vec<BackendInstance> {
        lock(&self.vms).values().map(|vm| vm.instance.clone()).collect()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        lock(&self.vms).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.vms).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u64 {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Most creates ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Most VMs ever present at once.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn list_all(&self) -> Result<Vec<BackendInstance>> {
        if let Some(err) = lock(&self.list_error).clone() {
            return Err(err);
        }
        Ok(self.instances())
    }

    async fn create(&self, request: &CreateRequest) -> Result<InstanceId> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let failure = lock(&self.create_failures)
            .pop_front()
            .or_else(|| lock(&self.create_error).clone());
        if let Some(err) = failure {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            debug!(instance_id = %request.id, error = %err, "[MOCK] Create failed");
            return Err(err);
        }

        info!(
            instance_id = %request.id,
            spec = %request.spec.key(),
            image = %request.spec.image,
            "[MOCK] Creating VM"
        );

        self.insert(
            BackendInstance {
                id: request.id,
                spec: request.spec.key(),
                created_at: request.created_at,
                dedup_key: request.dedup_key.clone(),
            },
            VmStatus::Active,
        );
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(request.id)
    }

    async fn delete(&self, id: &InstanceId) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.delete_error).clone() {
            return Err(err);
        }
        if self.terminate(id) {
            info!(instance_id = %id, "[MOCK] Deleted VM");
        } else {
            debug!(instance_id = %id, "[MOCK] VM already gone");
        }
        Ok(())
    }

    async fn status(&self, id: &InstanceId) -> Result<VmStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.status_error).clone() {
            return Err(err);
        }
        lock(&self.vms)
            .get(id)
            .map(|vm| vm.status)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunnerSpec, SpecKey};
    use chrono::Utc;

    fn request() -> CreateRequest {
        CreateRequest {
            id: InstanceId::new(),
            spec: RunnerSpec {
                flavor: "small".to_string(),
                label: "x64".to_string(),
                image: "noble".to_string(),
                desired: 1,
                backend: BackendKind::Mock,
            },
            dedup_key: None,
            jit_config: String::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_mock_backend_create_and_list() {
        let backend = MockBackend::new();
        let req = request();

        let id = backend.create(&req).await.unwrap();
        assert_eq!(id, req.id);

        let listed = backend.list(&SpecKey::new("small", "x64")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(backend
            .list(&SpecKey::new("large", "x64"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(backend.status(&id).await.unwrap(), VmStatus::Active);
    }

    #[tokio::test]
    async fn test_mock_backend_delete_is_idempotent() {
        let backend = MockBackend::new();
        let id = backend.create(&request()).await.unwrap();

        backend.delete(&id).await.unwrap();
        backend.delete(&id).await.unwrap();
        assert_eq!(backend.delete_calls(), 2);
        assert!(backend.is_empty());
        assert!(backend.status(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mock_backend_failing() {
        let backend = MockBackend::failing();
        let result = backend.create(&request()).await;
        assert!(matches!(result, Err(FleetError::Provision(_))));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_mock_backend_queued_failures() {
        let backend = MockBackend::new();
        backend.fail_next_creates(FleetError::QuotaExceeded("cores".into()), 1);

        assert!(backend.create(&request()).await.is_err());
        assert!(backend.create(&request()).await.is_ok());
        assert_eq!(backend.create_calls(), 2);
    }
}
