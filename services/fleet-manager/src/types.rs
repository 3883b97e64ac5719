//! Core fleet data model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use fleet_id::{DedupKey, InstanceId};
use fleet_reconcile::Fingerprint;
use serde::{Deserialize, Serialize};

// =============================================================================
// Backends
// =============================================================================

/// Virtualization provider a runner lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local virtualization daemon reached over a Unix socket.
    Local,

    /// Cloud compute REST API.
    Cloud,

    /// In-memory backend for development and tests.
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Cloud => "cloud",
            BackendKind::Mock => "mock",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-reported VM status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Provisioning,
    Active,
    Unreachable,
}

// =============================================================================
// Specs and Targets
// =============================================================================

/// Identity of a runner spec: one (flavor, label) combination.
///
/// Rendered as `flavor/label`; this form is stored in VM tags.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpecKey {
    pub flavor: String,
    pub label: String,
}

impl SpecKey {
    pub fn new(flavor: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            flavor: flavor.into(),
            label: label.into(),
        }
    }
}

impl std::fmt::Display for SpecKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.flavor, self.label)
    }
}

impl std::str::FromStr for SpecKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((flavor, label)) if !flavor.is_empty() && !label.is_empty() => {
                Ok(Self::new(flavor, label))
            }
            _ => Err(format!("invalid spec key '{s}', expected 'flavor/label'")),
        }
    }
}

impl TryFrom<String> for SpecKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SpecKey> for String {
    fn from(key: SpecKey) -> Self {
        key.to_string()
    }
}

/// A configured runner shape and how many idle runners to keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSpec {
    /// Resource profile name understood by the backend.
    pub flavor: String,

    /// CI label jobs use to target this spec.
    pub label: String,

    /// Image reference runners boot from.
    pub image: String,

    /// Standing pool size.
    pub desired: u32,

    /// Backend runners for this spec are created on.
    pub backend: BackendKind,
}

impl RunnerSpec {
    pub fn key(&self) -> SpecKey {
        SpecKey::new(&self.flavor, &self.label)
    }

    /// Fingerprint of everything that affects how runners are built.
    ///
    /// The desired count is excluded so scaling does not reset quarantine.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_json(&serde_json::json!({
            "flavor": self.flavor,
            "label": self.label,
            "image": self.image,
            "backend": self.backend,
        }))
    }
}

/// Desired fleet shape for one pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FleetTarget {
    pub specs: Vec<RunnerSpec>,

    /// Upper bound on live plus in-flight runners across all specs.
    pub global_cap: Option<u32>,
}

impl FleetTarget {
    pub fn spec(&self, key: &SpecKey) -> Option<&RunnerSpec> {
        self.specs.iter().find(|s| &s.key() == key)
    }

    pub fn desired(&self, key: &SpecKey) -> u32 {
        self.spec(key).map_or(0, |s| s.desired)
    }

    /// Find the spec a job targets. Flavor and label compare case-insensitively.
    pub fn spec_for_job(&self, flavor: &str, label: &str) -> Option<&RunnerSpec> {
        self.specs.iter().find(|s| {
            s.flavor.eq_ignore_ascii_case(flavor) && s.label.eq_ignore_ascii_case(label)
        })
    }

    pub fn backends(&self) -> BTreeSet<BackendKind> {
        self.specs.iter().map(|s| s.backend).collect()
    }
}

// =============================================================================
// Runner Instances
// =============================================================================

/// Lifecycle of a tracked runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created, not yet observed running or registered.
    Pending,

    /// Observed running or registered.
    Active,

    /// No activity within the health timeout.
    Unhealthy,

    /// Gone from the backend.
    Terminal,
}

impl Lifecycle {
    pub fn is_live(&self) -> bool {
        !matches!(self, Lifecycle::Terminal)
    }
}

/// Why a tracked runner left the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Disappeared from the backend without the manager deleting it.
    Vanished,

    /// Deleted to shrink the pool or retire an idle runner.
    Surplus,

    /// Deleted after missing the health timeout.
    Unhealthy,

    /// Deleted because its registration never appeared.
    Orphaned,

    /// Deleted by an operator flush.
    Flushed,
}

/// A runner as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInstance {
    pub id: InstanceId,
    pub spec: SpecKey,
    pub created_at: DateTime<Utc>,
    pub dedup_key: Option<DedupKey>,
}

/// A runner as the fleet manager tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerInstance {
    pub id: InstanceId,
    pub backend: BackendKind,
    pub spec: SpecKey,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,

    /// Last time the runner showed activity (online or busy registration).
    pub last_seen: DateTime<Utc>,

    /// Set for runners spawned for a specific job request.
    pub dedup_key: Option<DedupKey>,

    /// Set once the runner is Terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitReason>,
}

impl RunnerInstance {
    pub fn is_reactive(&self) -> bool {
        self.dedup_key.is_some()
    }
}

// =============================================================================
// CI Platform
// =============================================================================

/// Connectivity of a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Online,
    Offline,
}

/// A runner registered with the CI platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Platform-assigned runner id.
    pub id: u64,

    /// Runner name; equals the instance id for runners this manager created.
    pub name: String,

    pub status: RegistrationStatus,

    pub busy: bool,

    #[serde(default)]
    pub labels: Vec<String>,
}

impl Registration {
    /// The instance this registration belongs to, if it is one of ours.
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.name.parse().ok()
    }

    /// Whether the registration counts as activity for health purposes.
    pub fn is_active(&self) -> bool {
        self.status == RegistrationStatus::Online
    }
}

/// One-time registration credential handed to a runner at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationToken {
    /// Platform runner id created together with the token, if any.
    pub runner_id: Option<u64>,

    /// Opaque configuration the runner consumes on first boot.
    pub jit_config: String,
}

// =============================================================================
// Job Requests
// =============================================================================

/// A queued request for an on-demand runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Dedup key for at-most-once creation.
    pub id: DedupKey,

    pub flavor: String,

    pub label: String,

    pub enqueue_time: DateTime<Utc>,

    /// Every label the job asked for, when the queue carries them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Platform URL of the job, used to check whether it was already taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_url: Option<String>,
}

/// Which runners a flush removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only runners not executing a job.
    Idle,

    /// Idle and busy runners.
    Busy,
}
