//! Virtualization backend interface.
//!
//! Every provider implements the same four operations. Provider quirks
//! (asynchronous operations, server UUIDs, status vocabularies) stay inside
//! the implementation.
//!
//! Runner metadata travels with the VM as string tags so that the fleet view
//! can be rebuilt from the backend alone.

pub mod cloud;
pub mod local;
pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{DedupKey, InstanceId};

use crate::error::Result;
use crate::types::{BackendInstance, BackendKind, RunnerSpec, SpecKey, VmStatus};

pub use cloud::CloudBackend;
pub use local::LocalBackend;
pub use mock::MockBackend;

/// Tag holding the spec key.
pub const TAG_SPEC: &str = "runner-fleet.spec";

/// Tag holding the job dedup key of reactive runners.
pub const TAG_DEDUP_KEY: &str = "runner-fleet.dedup-key";

/// Tag holding the RFC 3339 creation time.
pub const TAG_CREATED_AT: &str = "runner-fleet.created-at";

/// Everything a backend needs to create one runner.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Name the VM is created under.
    pub id: InstanceId,
    pub spec: RunnerSpec,
    pub dedup_key: Option<DedupKey>,

    /// Registration configuration passed to the runner as user data.
    pub jit_config: String,
    pub created_at: DateTime<Utc>,
}

impl CreateRequest {
    /// Tags to attach to the VM.
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(TAG_SPEC.to_string(), self.spec.key().to_string());
        tags.insert(TAG_CREATED_AT.to_string(), self.created_at.to_rfc3339());
        if let Some(key) = &self.dedup_key {
            tags.insert(TAG_DEDUP_KEY.to_string(), key.to_string());
        }
        tags
    }
}

/// Cloud-init user data that hands the registration config to the runner.
pub fn render_user_data(jit_config: &str) -> String {
    format!(
        "#cloud-config\nwrite_files:\n  - path: /etc/runner-fleet/jit-config\n    permissions: '0600'\n    content: {}\n",
        serde_json::Value::String(jit_config.to_string())
    )
}

/// Rebuild a listed instance from its name and tags.
///
/// Returns `None` for VMs this manager did not create.
pub fn instance_from_tags(
    name: &str,
    tags: &BTreeMap<String, String>,
    fallback_created_at: Option<DateTime<Utc>>,
) -> Option<BackendInstance> {
    let id: InstanceId = name.parse().ok()?;
    let spec: SpecKey = tags.get(TAG_SPEC)?.parse().ok()?;
    let created_at = tags
        .get(TAG_CREATED_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .or(fallback_created_at)
        .or_else(|| DateTime::from_timestamp_millis(id.timestamp_ms() as i64))?;
    let dedup_key = tags
        .get(TAG_DEDUP_KEY)
        .and_then(|s| DedupKey::new(s.as_str()).ok());

    Some(BackendInstance {
        id,
        spec,
        created_at,
        dedup_key,
    })
}

/// Uniform operations over a virtualization provider.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which provider this is.
    fn kind(&self) -> BackendKind;

    /// All runners managed by this fleet on this backend.
    async fn list_all(&self) -> Result<Vec<BackendInstance>>;

    /// Runners for one spec. Empty when there are none.
    async fn list(&self, spec: &SpecKey) -> Result<Vec<BackendInstance>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|i| &i.spec == spec)
            .collect())
    }

    /// Create a runner. Either the VM exists under `request.id` afterwards
    /// or an error is returned.
    async fn create(&self, request: &CreateRequest) -> Result<InstanceId>;

    /// Delete a runner. Deleting a runner that is already gone succeeds.
    async fn delete(&self, id: &InstanceId) -> Result<()>;

    /// Current status of a runner.
    async fn status(&self, id: &InstanceId) -> Result<VmStatus>;
}
