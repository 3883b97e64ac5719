//! Configuration for the fleet manager.
//!
//! Process settings come from `FLEET_*` environment variables. The fleet
//! shape (specs, cap, timeouts) comes from a TOML file and is validated
//! before anything else sees it.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_reconcile::{
    DEFAULT_HEALTH_TIMEOUT, DEFAULT_ORPHAN_GRACE, DEFAULT_PASS_TIMEOUT,
    DEFAULT_QUARANTINE_THRESHOLD, DEFAULT_QUARANTINE_WINDOW, DEFAULT_RECONCILE_INTERVAL,
};
use serde::Deserialize;
use thiserror::Error;

use crate::types::{BackendKind, FleetTarget, RunnerSpec};

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin API listen address.
    pub listen_addr: String,

    /// Path to the fleet TOML file.
    pub fleet_file: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Local virtualization daemon socket.
    pub local_socket: String,

    /// Cloud compute endpoint; the cloud backend is disabled when unset.
    pub cloud_url: Option<String>,

    /// Cloud API token.
    pub cloud_token: String,

    /// Cloud network to attach runners to.
    pub cloud_network: Option<String>,

    /// CI platform API base URL.
    pub platform_url: String,

    /// CI platform API token.
    pub platform_token: String,

    /// `org` or `owner/repo` the runners register under.
    pub platform_path: String,

    /// Runner group id used for organisation-scoped registration.
    pub runner_group_id: u64,

    /// Job queue server; reactive mode is disabled when unset.
    pub queue_url: Option<String>,

    /// Job queue stream name.
    pub queue_stream: String,

    /// Job queue subject filter.
    pub queue_subject: String,

    /// Durable consumer name.
    pub queue_consumer: String,

    /// Directory runners write job outcome records into.
    pub exchange_dir: String,

    /// Metric event log file.
    pub metrics_log: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            std::env::var("FLEET_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8089".to_string());

        let fleet_file = std::env::var("FLEET_CONFIG")
            .unwrap_or_else(|_| "/etc/runner-fleet/fleet.toml".to_string());

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let local_socket = std::env::var("FLEET_LOCAL_SOCKET")
            .unwrap_or_else(|_| "/var/snap/lxd/common/lxd/unix.socket".to_string());

        let cloud_url = std::env::var("FLEET_CLOUD_URL").ok();
        let cloud_token = std::env::var("FLEET_CLOUD_TOKEN").unwrap_or_default();
        let cloud_network = std::env::var("FLEET_CLOUD_NETWORK").ok();

        let platform_url = std::env::var("FLEET_PLATFORM_URL")
            .unwrap_or_else(|_| "https://api.github.com".to_string());
        let platform_token = std::env::var("FLEET_PLATFORM_TOKEN").unwrap_or_default();
        let platform_path = std::env::var("FLEET_PLATFORM_PATH")
            .context("FLEET_PLATFORM_PATH must name an organisation or owner/repo")?;
        let runner_group_id = std::env::var("FLEET_RUNNER_GROUP_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let queue_url = std::env::var("FLEET_QUEUE_URL").ok();
        let queue_stream =
            std::env::var("FLEET_QUEUE_STREAM").unwrap_or_else(|_| "RUNNER_JOBS".to_string());
        let queue_subject =
            std::env::var("FLEET_QUEUE_SUBJECT").unwrap_or_else(|_| "jobs.>".to_string());
        let queue_consumer =
            std::env::var("FLEET_QUEUE_CONSUMER").unwrap_or_else(|_| "fleet-manager".to_string());

        let exchange_dir = std::env::var("FLEET_EXCHANGE_DIR")
            .unwrap_or_else(|_| "/var/lib/runner-fleet/metrics".to_string());
        let metrics_log = std::env::var("FLEET_METRICS_LOG")
            .unwrap_or_else(|_| "/var/log/runner-fleet/metrics.log".to_string());

        Ok(Self {
            listen_addr,
            fleet_file,
            log_level,
            local_socket,
            cloud_url,
            cloud_token,
            cloud_network,
            platform_url,
            platform_token,
            platform_path,
            runner_group_id,
            queue_url,
            queue_stream,
            queue_subject,
            queue_consumer,
            exchange_dir,
            metrics_log,
        })
    }
}

// =============================================================================
// Fleet File
// =============================================================================

/// Fleet configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("spec {flavor}/{label} is defined more than once")]
    DuplicateSpec { flavor: String, label: String },

    #[error("invalid {field} '{value}': {reason}")]
    InvalidName {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("quarantine threshold must be at least 1")]
    InvalidQuarantineThreshold,
}

/// Quarantine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuarantineSettings {
    /// Consecutive create failures before a spec is quarantined.
    pub threshold: u32,
    pub window_secs: u64,
}

impl Default for QuarantineSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_QUARANTINE_THRESHOLD,
            window_secs: DEFAULT_QUARANTINE_WINDOW.as_secs(),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSettings {
    /// Time without activity before a runner is unhealthy.
    pub timeout_secs: u64,

    /// Time a VM may run without a registration before it is an orphan.
    pub orphan_grace_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HEALTH_TIMEOUT.as_secs(),
            orphan_grace_secs: DEFAULT_ORPHAN_GRACE.as_secs(),
        }
    }
}

/// Reactive consumer settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReactiveSettings {
    pub enabled: bool,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,

    /// Extra labels jobs may carry besides spec labels (e.g. `self-hosted`).
    pub supported_labels: Vec<String>,

    /// How long a consumed dedup key is remembered after its runner is gone.
    pub dedup_retention_secs: u64,

    /// How long a job runner may sit idle before it is retired.
    pub idle_grace_secs: u64,
}

impl Default for ReactiveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 10,
            poll_interval_secs: 5,
            backoff_initial_ms: 500,
            backoff_max_secs: 60,
            supported_labels: vec![
                "self-hosted".to_string(),
                "linux".to_string(),
                "x64".to_string(),
            ],
            dedup_retention_secs: 24 * 60 * 60,
            idle_grace_secs: 30 * 60,
        }
    }
}

/// Validated fleet configuration consumed by the core.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FleetConfig {
    /// Cap on live plus in-flight runners across all specs; 0 disables it.
    pub global_cap: u32,
    pub reconcile_interval_secs: u64,
    pub pass_timeout_secs: u64,

    /// Concurrent backend calls per pass.
    pub worker_concurrency: usize,

    pub quarantine: QuarantineSettings,
    pub health: HealthSettings,
    pub reactive: ReactiveSettings,
    pub specs: Vec<RunnerSpec>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            global_cap: 0,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL.as_secs(),
            pass_timeout_secs: DEFAULT_PASS_TIMEOUT.as_secs(),
            worker_concurrency: 8,
            quarantine: QuarantineSettings::default(),
            health: HealthSettings::default(),
            reactive: ReactiveSettings::default(),
            specs: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Load and validate a fleet file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fleet config {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid fleet config {}", path.display()))
    }

    /// Parse and validate fleet configuration from TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::MustBePositive("reconcile_interval_secs"));
        }
        if self.pass_timeout_secs == 0 {
            return Err(ConfigError::MustBePositive("pass_timeout_secs"));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::MustBePositive("worker_concurrency"));
        }
        if self.health.timeout_secs == 0 {
            return Err(ConfigError::MustBePositive("health.timeout_secs"));
        }
        if self.quarantine.threshold == 0 {
            return Err(ConfigError::InvalidQuarantineThreshold);
        }
        if self.reactive.enabled && self.reactive.batch_size == 0 {
            return Err(ConfigError::MustBePositive("reactive.batch_size"));
        }

        let mut seen = BTreeSet::new();
        for spec in &self.specs {
            validate_name("flavor", &spec.flavor)?;
            validate_name("label", &spec.label)?;
            if spec.image.trim().is_empty() {
                return Err(ConfigError::InvalidName {
                    field: "image",
                    value: spec.image.clone(),
                    reason: "must not be empty",
                });
            }
            if !seen.insert(spec.key()) {
                return Err(ConfigError::DuplicateSpec {
                    flavor: spec.flavor.clone(),
                    label: spec.label.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn target(&self) -> FleetTarget {
        FleetTarget {
            specs: self.specs.clone(),
            global_cap: (self.global_cap > 0).then_some(self.global_cap),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health.timeout_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.health.orphan_grace_secs)
    }

    pub fn quarantine_window(&self) -> Duration {
        Duration::from_secs(self.quarantine.window_secs)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.reactive.dedup_retention_secs)
    }

    pub fn reactive_idle_grace(&self) -> Duration {
        Duration::from_secs(self.reactive.idle_grace_secs)
    }

    /// Backends referenced by at least one spec.
    pub fn backends(&self) -> BTreeSet<BackendKind> {
        self.specs.iter().map(|s| s.backend).collect()
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidName {
            field,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidName {
            field,
            value: value.to_string(),
            reason: "must not contain '/' or whitespace",
        });
    }
    Ok(())
}
