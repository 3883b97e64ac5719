//! Local virtualization backend.
//!
//! Talks to an LXD-compatible daemon over its Unix socket. Mutating calls
//! return background operations which are awaited before returning, so a
//! successful `create` means the VM exists and was started.
//!
//! Fleet tags are stored as `user.*` instance config keys.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{instance_from_tags, render_user_data, Backend, CreateRequest};
use crate::error::{FleetError, Result};
use crate::types::{BackendInstance, BackendKind, VmStatus};

const USER_PREFIX: &str = "user.";

/// Errors from the local daemon API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("operation failed: {0}")]
    Operation(String),
}

impl ApiError {
    fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Api { status: 404, .. })
    }

    fn into_fleet(self, context: &str) -> FleetError {
        match self {
            ApiError::Http(e) => FleetError::unreachable(BackendKind::Local, e),
            ApiError::Api { status: 404, message } => {
                FleetError::NotFound(format!("{context}: {message}"))
            }
            ApiError::Api { message, .. } | ApiError::Operation(message)
                if is_quota_message(&message) =>
            {
                FleetError::QuotaExceeded(format!("{context}: {message}"))
            }
            other => FleetError::Provision(format!("{context}: {other}")),
        }
    }
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("quota") || lower.contains("limit") || lower.contains("maximum number")
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    status: String,
    #[serde(default)]
    err: String,
}

#[derive(Debug, Deserialize)]
struct InstanceMetadata {
    name: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StateMetadata {
    status: String,
}

#[derive(Debug, Serialize)]
struct InstanceSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    alias: &'a str,
}

#[derive(Debug, Serialize)]
struct InstancesPost<'a> {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    source: InstanceSource<'a>,
    profiles: Vec<&'a str>,
    config: BTreeMap<String, String>,
    start: bool,
}

#[derive(Debug, Serialize)]
struct StatePut {
    action: &'static str,
    force: bool,
    timeout: i64,
}

/// Backend for a local virtualization daemon.
pub struct LocalBackend {
    socket_path: String,
    client: Client<UnixConnector>,
    operation_timeout: Duration,
}

impl LocalBackend {
    /// Create a backend for the daemon socket at `socket_path`.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
            operation_timeout: Duration::from_secs(300),
        }
    }

    /// How long to wait for background operations.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Envelope, ApiError> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(method = %method, path = path, "Local daemon request");

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;
        let envelope: Envelope = serde_json::from_reader(body.reader())?;

        if !status.is_success() || envelope.kind == "error" {
            return Err(ApiError::Api {
                status: status.as_u16(),
                message: envelope.error.unwrap_or_else(|| status.to_string()),
            });
        }
        Ok(envelope)
    }

    /// Wait for the background operation an envelope refers to.
    async fn wait(&self, envelope: Envelope) -> Result<(), ApiError> {
        if envelope.kind != "async" {
            return Ok(());
        }
        let Some(operation) = envelope.operation else {
            return Ok(());
        };

        let path = format!("{}/wait?timeout={}", operation, self.operation_timeout.as_secs());
        let done = self.call(Method::GET, &path, None).await?;
        let metadata: OperationMetadata = serde_json::from_value(done.metadata)?;
        if metadata.status == "Success" {
            Ok(())
        } else {
            Err(ApiError::Operation(if metadata.err.is_empty() {
                metadata.status
            } else {
                metadata.err
            }))
        }
    }

    async fn remove(&self, id: &InstanceId) -> Result<(), ApiError> {
        let path = format!("/1.0/instances/{id}");

        let stop = serde_json::to_vec(&StatePut {
            action: "stop",
            force: true,
            timeout: 30,
        })?;
        match self
            .call(Method::PUT, &format!("{path}/state"), Some(stop))
            .await
        {
            Ok(envelope) => {
                if let Err(e) = self.wait(envelope).await {
                    // Already stopped instances fail the stop operation
                    debug!(instance_id = %id, error = %e, "Stop operation did not succeed");
                }
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => debug!(instance_id = %id, error = %e, "Stop request rejected"),
        }

        match self.call(Method::DELETE, &path, None).await {
            Ok(envelope) => self.wait(envelope).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Parse an instance listing into fleet instances, skipping foreign VMs.
fn parse_listing(metadata: serde_json::Value) -> Result<Vec<BackendInstance>, ApiError> {
    let raw: Vec<InstanceMetadata> = serde_json::from_value(metadata)?;
    Ok(raw
        .into_iter()
        .filter_map(|vm| {
            let tags: BTreeMap<String, String> = vm
                .config
                .iter()
                .filter_map(|(k, v)| Some((k.strip_prefix(USER_PREFIX)?.to_string(), v.clone())))
                .collect();
            instance_from_tags(&vm.name, &tags, vm.created_at)
        })
        .collect())
}

fn map_status(status: &str) -> VmStatus {
    match status {
        "Running" | "Ready" => VmStatus::Active,
        "Pending" | "Starting" | "Started" | "Operation created" => VmStatus::Provisioning,
        _ => VmStatus::Unreachable,
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn list_all(&self) -> Result<Vec<BackendInstance>> {
        let envelope = self
            .call(Method::GET, "/1.0/instances?recursion=1", None)
            .await
            .map_err(|e| FleetError::unreachable(BackendKind::Local, e))?;
        parse_listing(envelope.metadata)
            .map_err(|e| FleetError::unreachable(BackendKind::Local, e))
    }

    async fn create(&self, request: &CreateRequest) -> Result<InstanceId> {
        let mut config: BTreeMap<String, String> = request
            .tags()
            .into_iter()
            .map(|(k, v)| (format!("{USER_PREFIX}{k}"), v))
            .collect();
        config.insert(
            "cloud-init.user-data".to_string(),
            render_user_data(&request.jit_config),
        );

        let body = InstancesPost {
            name: request.id.to_string(),
            kind: "virtual-machine",
            source: InstanceSource {
                kind: "image",
                alias: &request.spec.image,
            },
            profiles: vec!["default", &request.spec.flavor],
            config,
            start: true,
        };
        let body = serde_json::to_vec(&body).map_err(|e| FleetError::Provision(e.to_string()))?;

        info!(
            instance_id = %request.id,
            spec = %request.spec.key(),
            image = %request.spec.image,
            "Creating local VM"
        );

        let result = match self.call(Method::POST, "/1.0/instances", Some(body)).await {
            Ok(envelope) => self.wait(envelope).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            // Do not leave a half-created VM behind
            if let Err(cleanup) = self.remove(&request.id).await {
                warn!(
                    instance_id = %request.id,
                    error = %cleanup,
                    "Failed to clean up VM after failed create"
                );
            }
            return Err(e.into_fleet("create instance"));
        }

        Ok(request.id)
    }

    async fn delete(&self, id: &InstanceId) -> Result<()> {
        info!(instance_id = %id, "Deleting local VM");
        match self.remove(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into_fleet("delete instance")),
        }
    }

    async fn status(&self, id: &InstanceId) -> Result<VmStatus> {
        let envelope = self
            .call(Method::GET, &format!("/1.0/instances/{id}/state"), None)
            .await
            .map_err(|e| e.into_fleet("instance state"))?;
        let state: StateMetadata = serde_json::from_value(envelope.metadata)
            .map_err(|e| FleetError::unreachable(BackendKind::Local, e))?;
        Ok(map_status(&state.status))
    }
}
