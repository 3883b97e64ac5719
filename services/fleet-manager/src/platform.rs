//! CI platform runner registration client.
//!
//! The platform is consumed, not implemented: list and delete registered
//! runners, mint just-in-time registration configs, and check whether a job
//! was already taken.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{DedupKey, InstanceId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{FleetError, Result};
use crate::types::{JobRequest, Registration, RegistrationStatus, RegistrationToken, RunnerSpec};

/// Where runners register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformPath {
    /// Organisation-wide runners in a runner group.
    Organisation { org: String, group_id: u64 },

    /// Repository-scoped runners.
    Repository { owner: String, repo: String },
}

impl PlatformPath {
    /// Parse `org` or `owner/repo`.
    pub fn parse(path: &str, group_id: u64) -> Result<Self, String> {
        match path.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Ok(Self::Repository {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                })
            }
            None if !path.is_empty() => Ok(Self::Organisation {
                org: path.to_string(),
                group_id,
            }),
            _ => Err(format!("invalid platform path '{path}'")),
        }
    }

    /// API path prefix for runner endpoints.
    fn prefix(&self) -> String {
        match self {
            Self::Organisation { org, .. } => format!("orgs/{org}"),
            Self::Repository { owner, repo } => format!("repos/{owner}/{repo}"),
        }
    }

    fn group_id(&self) -> u64 {
        match self {
            Self::Organisation { group_id, .. } => *group_id,
            Self::Repository { .. } => 1,
        }
    }
}

/// CI platform operations the fleet needs.
#[async_trait]
pub trait Platform: Send + Sync {
    /// All runners registered under the configured path.
    async fn list_registrations(&self) -> Result<Vec<Registration>>;

    /// Remove a registration. Removing an unknown registration succeeds.
    async fn delete_registration(&self, registration_id: u64) -> Result<()>;

    /// Register `instance` ahead of boot and return its one-time config.
    async fn registration_token(
        &self,
        instance: &InstanceId,
        spec: &RunnerSpec,
    ) -> Result<RegistrationToken>;

    /// Whether the job behind a request was already taken by some runner.
    async fn job_picked_up(&self, job: &JobRequest) -> Result<bool>;
}

// =============================================================================
// HTTP Platform
// =============================================================================

#[derive(Debug, Deserialize)]
struct RunnerList {
    #[serde(default)]
    total_count: usize,
    runners: Vec<RunnerPayload>,
}

#[derive(Debug, Deserialize)]
struct RunnerPayload {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    labels: Vec<LabelPayload>,
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    name: String,
}

#[derive(Debug, Serialize)]
struct JitConfigRequest<'a> {
    name: String,
    runner_group_id: u64,
    labels: Vec<&'a str>,
    work_folder: &'static str,
}

#[derive(Debug, Deserialize)]
struct JitConfigResponse {
    runner: JitRunner,
    encoded_jit_config: String,
}

#[derive(Debug, Deserialize)]
struct JitRunner {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JobPayload {
    status: String,
}

const PAGE_SIZE: usize = 100;

/// GitHub-compatible REST platform client.
pub struct HttpPlatform {
    client: reqwest::Client,
    base_url: String,
    token: String,
    path: PlatformPath,
}

impl HttpPlatform {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        path: PlatformPath,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("runner-fleet/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            path,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn failure(response: reqwest::Response, what: &str) -> FleetError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "CI platform request failed: {}", what);
        FleetError::PlatformUnavailable(format!("{what}: {status} - {body}"))
    }
}

fn transport(e: reqwest::Error) -> FleetError {
    FleetError::PlatformUnavailable(e.to_string())
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn list_registrations(&self) -> Result<Vec<Registration>> {
        let url = format!("{}/{}/actions/runners", self.base_url, self.path.prefix());
        let mut registrations = Vec::new();
        let mut page = 1usize;

        loop {
            let response = self
                .request(reqwest::Method::GET, &url)
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await
                .map_err(transport)?;
            if !response.status().is_success() {
                return Err(Self::failure(response, "list runners").await);
            }

            let list: RunnerList = response.json().await.map_err(transport)?;
            let fetched = list.runners.len();
            registrations.extend(list.runners.into_iter().map(|r| Registration {
                id: r.id,
                name: r.name,
                status: if r.status == "online" {
                    RegistrationStatus::Online
                } else {
                    RegistrationStatus::Offline
                },
                busy: r.busy,
                labels: r.labels.into_iter().map(|l| l.name).collect(),
            }));

            if fetched < PAGE_SIZE || registrations.len() >= list.total_count {
                break;
            }
            page += 1;
        }

        debug!(count = registrations.len(), "Listed runner registrations");
        Ok(registrations)
    }

    async fn delete_registration(&self, registration_id: u64) -> Result<()> {
        let url = format!(
            "{}/{}/actions/runners/{}",
            self.base_url,
            self.path.prefix(),
            registration_id
        );
        let response = self
            .request(reqwest::Method::DELETE, &url)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            info!(registration_id, "Deleted runner registration");
            return Ok(());
        }
        Err(Self::failure(response, "delete runner").await)
    }

    async fn registration_token(
        &self,
        instance: &InstanceId,
        spec: &RunnerSpec,
    ) -> Result<RegistrationToken> {
        let url = format!(
            "{}/{}/actions/runners/generate-jitconfig",
            self.base_url,
            self.path.prefix()
        );
        let body = JitConfigRequest {
            name: instance.to_string(),
            runner_group_id: self.path.group_id(),
            labels: vec![spec.label.as_str(), spec.flavor.as_str()],
            work_folder: "_work",
        };

        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(Self::failure(response, "generate jit config").await);
        }

        let jit: JitConfigResponse = response.json().await.map_err(transport)?;
        Ok(RegistrationToken {
            runner_id: Some(jit.runner.id),
            jit_config: jit.encoded_jit_config,
        })
    }

    async fn job_picked_up(&self, job: &JobRequest) -> Result<bool> {
        let url = match (&job.job_url, &self.path) {
            (Some(url), _) => url.clone(),
            (None, PlatformPath::Repository { owner, repo }) => format!(
                "{}/repos/{}/{}/actions/jobs/{}",
                self.base_url, owner, repo, job.id
            ),
            // Organisation jobs cannot be resolved without a job URL
            (None, PlatformPath::Organisation { .. }) => return Ok(false),
        };

        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(Self::failure(response, "get job").await);
        }
        let payload: JobPayload = response.json().await.map_err(transport)?;
        Ok(!matches!(payload.status.as_str(), "queued" | "pending" | "waiting"))
    }
}

// =============================================================================
// Mock Platform
// =============================================================================

/// In-memory platform for testing and development.
///
/// Issuing a registration token registers the runner as online and idle, as
/// a runner that boots and connects immediately would.
pub struct MockPlatform {
    registrations: Mutex<BTreeMap<u64, Registration>>,
    next_id: AtomicU64,
    picked_up: Mutex<BTreeSet<DedupKey>>,
    list_error: Mutex<Option<FleetError>>,
    token_error: Mutex<Option<FleetError>>,
    auto_register: bool,
    delete_calls: AtomicU64,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            picked_up: Mutex::new(BTreeSet::new()),
            list_error: Mutex::new(None),
            token_error: Mutex::new(None),
            auto_register: true,
            delete_calls: AtomicU64::new(0),
        }
    }

    /// A platform where tokens do not create registrations; runners never
    /// show up until [`MockPlatform::register`] is called.
    pub fn without_auto_register() -> Self {
        Self {
            auto_register: false,
            ..Self::new()
        }
    }

    /// Register a runner by name.
    pub fn register(&self, name: &str, status: RegistrationStatus, busy: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.registrations).insert(
            id,
            Registration {
                id,
                name: name.to_string(),
                status,
                busy,
                labels: Vec::new(),
            },
        );
        id
    }

    /// Update an existing registration by runner name.
    pub fn set_state(&self, name: &str, status: RegistrationStatus, busy: bool) {
        for reg in lock(&self.registrations).values_mut() {
            if reg.name == name {
                reg.status = status;
                reg.busy = busy;
            }
        }
    }

    pub fn unregister(&self, name: &str) {
        lock(&self.registrations).retain(|_, r| r.name != name);
    }

    pub fn registration_names(&self) -> BTreeSet<String> {
        lock(&self.registrations)
            .values()
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn mark_picked_up(&self, job: &DedupKey) {
        lock(&self.picked_up).insert(job.clone());
    }

    pub fn set_list_error(&self, error: Option<FleetError>) {
        *lock(&self.list_error) = error;
    }

    pub fn set_token_error(&self, error: Option<FleetError>) {
        *lock(&self.token_error) = error;
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Platform for MockPlatform {
    async fn list_registrations(&self) -> Result<Vec<Registration>> {
        if let Some(err) = lock(&self.list_error).clone() {
            return Err(err);
        }
        Ok(lock(&self.registrations).values().cloned().collect())
    }

    async fn delete_registration(&self, registration_id: u64) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.registrations).remove(&registration_id);
        Ok(())
    }

    async fn registration_token(
        &self,
        instance: &InstanceId,
        _spec: &RunnerSpec,
    ) -> Result<RegistrationToken> {
        if let Some(err) = lock(&self.token_error).clone() {
            return Err(err);
        }
        let runner_id = if self.auto_register {
            self.register(&instance.to_string(), RegistrationStatus::Online, false)
        } else {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        };
        Ok(RegistrationToken {
            runner_id: Some(runner_id),
            jit_config: format!("mock-jit-{runner_id}"),
        })
    }

    async fn job_picked_up(&self, job: &JobRequest) -> Result<bool> {
        Ok(lock(&self.picked_up).contains(&job.id))
    }
}
