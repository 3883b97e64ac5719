//! Test harness for fleet manager integration tests.
//!
//! Wires the reconciler and the reactive consumer to mock backends, a mock
//! CI platform, an in-memory queue and in-memory metrics.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{DedupKey, InstanceId, Ulid};
use fleet_manager::backend::{Backend, MockBackend};
use fleet_manager::capacity::{CapacityGate, FleetLedger};
use fleet_manager::config::ReactiveSettings;
use fleet_manager::health::HealthMonitor;
use fleet_manager::metrics::{MemoryExchange, MemorySink, MetricsAggregator};
use fleet_manager::platform::MockPlatform;
use fleet_manager::provision::Provisioner;
use fleet_manager::reactive::{MemoryQueue, ReactiveConsumer};
use fleet_manager::reconciler::{Reconciler, ReconcilerSettings};
use fleet_manager::types::{BackendInstance, BackendKind, FleetTarget, RunnerSpec, VmStatus};
use tokio::sync::watch;

pub const QUARANTINE_THRESHOLD: u32 = 3;
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const ORPHAN_GRACE: Duration = Duration::from_secs(5 * 60);
pub const REACTIVE_IDLE_GRACE: Duration = Duration::from_secs(30 * 60);

static NEXT_RANDOM: AtomicU64 = AtomicU64::new(1);

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub platform: Arc<MockPlatform>,
    pub exchange: Arc<MemoryExchange>,
    pub sink: Arc<MemorySink>,
    pub gate: Arc<CapacityGate>,
    pub provisioner: Arc<Provisioner>,
    pub reconciler: Reconciler,
    pub queue: MemoryQueue,
    pub target: watch::Sender<FleetTarget>,
    pub consumer: ReactiveConsumer,
}

pub struct HarnessBuilder {
    backends: Vec<(BackendKind, Arc<MockBackend>)>,
    platform: MockPlatform,
    target: FleetTarget,
    worker_concurrency: usize,
}

impl HarnessBuilder {
    pub fn new(target: FleetTarget) -> Self {
        Self {
            backends: Vec::new(),
            platform: MockPlatform::new(),
            target,
            worker_concurrency: 4,
        }
    }

    pub fn backend(mut self, kind: BackendKind, backend: Arc<MockBackend>) -> Self {
        self.backends.push((kind, backend));
        self
    }

    pub fn platform(mut self, platform: MockPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    pub fn build(mut self) -> Harness {
        if self.backends.is_empty() {
            self.backends.push((BackendKind::Mock, Arc::new(MockBackend::new())));
        }
        let backend = self.backends[0].1.clone();
        let backends: BTreeMap<BackendKind, Arc<dyn Backend>> = self
            .backends
            .iter()
            .map(|(kind, b)| (*kind, b.clone() as Arc<dyn Backend>))
            .collect();

        let platform = Arc::new(self.platform);
        let exchange = Arc::new(MemoryExchange::new());
        let sink = Arc::new(MemorySink::new());
        let mut ledger = FleetLedger::new(
            QUARANTINE_THRESHOLD,
            Duration::from_secs(600),
            Duration::from_secs(3600),
        );
        ledger.set_cap(self.target.global_cap);
        let gate = Arc::new(CapacityGate::new(ledger));
        let provisioner = Arc::new(Provisioner::new(backends, platform.clone(), gate.clone()));

        let reconciler = Reconciler::new(
            provisioner.clone(),
            HealthMonitor::new(HEALTH_TIMEOUT, ORPHAN_GRACE),
            Arc::new(MetricsAggregator::new(exchange.clone(), sink.clone())),
            ReconcilerSettings {
                worker_concurrency: self.worker_concurrency,
                pass_timeout: Duration::from_secs(30),
                reactive_idle_grace: REACTIVE_IDLE_GRACE,
            },
        );

        let queue = MemoryQueue::new();
        let (target, target_rx) = watch::channel(self.target);
        let consumer = ReactiveConsumer::new(
            Arc::new(queue.clone()),
            provisioner.clone(),
            target_rx,
            ReactiveSettings {
                enabled: true,
                ..ReactiveSettings::default()
            },
        );

        Harness {
            backend,
            platform,
            exchange,
            sink,
            gate,
            provisioner,
            reconciler,
            queue,
            target,
            consumer,
        }
    }
}

impl Harness {
    pub fn new(target: FleetTarget) -> Self {
        HarnessBuilder::new(target).build()
    }

    pub fn current_target(&self) -> FleetTarget {
        self.target.borrow().clone()
    }

    pub async fn pass(&self) -> fleet_manager::reconciler::PassReport {
        let target = self.current_target();
        self.reconciler.run_pass(&target).await
    }
}

pub fn spec(flavor: &str, desired: u32) -> RunnerSpec {
    RunnerSpec {
        flavor: flavor.to_string(),
        label: "x64".to_string(),
        image: "noble".to_string(),
        desired,
        backend: BackendKind::Mock,
    }
}

pub fn target(specs: Vec<RunnerSpec>, global_cap: Option<u32>) -> FleetTarget {
    FleetTarget { specs, global_cap }
}

pub fn ago(duration: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(duration).unwrap()
}

/// An instance id minted `age` ago.
pub fn old_instance_id(age: Duration) -> InstanceId {
    let ms = ago(age).timestamp_millis() as u64;
    let random = NEXT_RANDOM.fetch_add(1, Ordering::SeqCst);
    InstanceId::from_ulid(Ulid::from_parts(ms, u128::from(random)))
}

/// Place a VM on the backend as if created `age` ago by an earlier process.
pub fn existing_vm(
    backend: &MockBackend,
    spec: &RunnerSpec,
    age: Duration,
    status: VmStatus,
) -> InstanceId {
    insert_vm(backend, spec, age, status, None)
}

/// Like [`existing_vm`], for a runner spawned for `job`.
pub fn existing_job_vm(backend: &MockBackend, spec: &RunnerSpec, age: Duration, job: &str) -> InstanceId {
    let key = DedupKey::new(job).unwrap();
    insert_vm(backend, spec, age, VmStatus::Active, Some(key))
}

fn insert_vm(
    backend: &MockBackend,
    spec: &RunnerSpec,
    age: Duration,
    status: VmStatus,
    dedup_key: Option<DedupKey>,
) -> InstanceId {
    let id = old_instance_id(age);
    backend.insert(
        BackendInstance {
            id,
            spec: spec.key(),
            created_at: ago(age),
            dedup_key,
        },
        status,
    );
    id
}
