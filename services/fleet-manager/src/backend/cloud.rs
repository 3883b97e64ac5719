//! Cloud compute backend.
//!
//! Speaks an OpenStack-compute-style REST API. Servers are created under the
//! runner id as their name and looked up by name, since the provider assigns
//! its own server ids. Fleet tags are stored as server metadata.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{instance_from_tags, render_user_data, Backend, CreateRequest};
use crate::error::{FleetError, Result};
use crate::types::{BackendInstance, BackendKind, VmStatus};

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ServerCreate<'a> {
    server: ServerCreateBody<'a>,
}

#[derive(Debug, Serialize)]
struct ServerCreateBody<'a> {
    name: String,
    #[serde(rename = "imageRef")]
    image_ref: &'a str,
    #[serde(rename = "flavorRef")]
    flavor_ref: &'a str,
    metadata: BTreeMap<String, String>,
    user_data: String,
    networks: serde_json::Value,
}

/// Backend for a cloud compute API.
pub struct CloudBackend {
    client: reqwest::Client,
    base_url: String,
    token: String,
    network: Option<String>,
}

impl CloudBackend {
    /// Create a cloud backend for the compute endpoint at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        network: Option<String>,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            network,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> FleetError {
        FleetError::unreachable(BackendKind::Cloud, e)
    }

    async fn servers(&self, name_filter: &str) -> Result<Vec<Server>> {
        let url = format!("{}/servers/detail", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("X-Auth-Token", &self.token)
            .query(&[("name", name_filter)])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to list servers");
            return Err(FleetError::unreachable(
                BackendKind::Cloud,
                format!("list servers: {status} - {body}"),
            ));
        }

        let list: ServerList = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(list.servers)
    }

    /// Provider server id for a runner, if the server exists.
    async fn find(&self, id: &InstanceId) -> Result<Option<Server>> {
        let filter = format!("^{id}$");
        Ok(self
            .servers(&filter)
            .await?
            .into_iter()
            .find(|s| s.name == id.to_string()))
    }

    /// Remove a server a failed create request may still have produced.
    async fn cleanup_failed_create(&self, id: &InstanceId) {
        if let Err(e) = self.delete(id).await {
            warn!(instance_id = %id, error = %e, "Cleanup after failed create failed");
        }
    }

    fn networks(&self) -> serde_json::Value {
        match &self.network {
            Some(uuid) => serde_json::json!([{ "uuid": uuid }]),
            None => serde_json::json!("auto"),
        }
    }
}

fn map_create_failure(status: StatusCode, body: &str) -> FleetError {
    let quota = body.to_ascii_lowercase().contains("quota");
    match status {
        StatusCode::PAYLOAD_TOO_LARGE => FleetError::QuotaExceeded(body.to_string()),
        StatusCode::FORBIDDEN if quota => FleetError::QuotaExceeded(body.to_string()),
        _ => FleetError::Provision(format!("{status} - {body}")),
    }
}

fn map_status(status: Option<&str>) -> VmStatus {
    match status {
        Some("ACTIVE") => VmStatus::Active,
        Some("BUILD") => VmStatus::Provisioning,
        _ => VmStatus::Unreachable,
    }
}

#[async_trait]
impl Backend for CloudBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn list_all(&self) -> Result<Vec<BackendInstance>> {
        let filter = format!("^{}-", InstanceId::PREFIX);
        let servers = self.servers(&filter).await?;
        debug!(count = servers.len(), "Listed cloud servers");
        Ok(servers
            .into_iter()
            .filter_map(|s| instance_from_tags(&s.name, &s.metadata, s.created))
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> Result<InstanceId> {
        let body = ServerCreate {
            server: ServerCreateBody {
                name: request.id.to_string(),
                image_ref: &request.spec.image,
                flavor_ref: &request.spec.flavor,
                metadata: request.tags(),
                user_data: STANDARD.encode(render_user_data(&request.jit_config)),
                networks: self.networks(),
            },
        };

        info!(
            instance_id = %request.id,
            spec = %request.spec.key(),
            image = %request.spec.image,
            "Creating cloud server"
        );

        let url = format!("{}/servers", self.base_url);
        let response = match self
            .client
            .post(&url)
            .header("X-Auth-Token", &self.token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_connect() => return Err(self.transport_error(e)),
            Err(e) => {
                // The server may have been accepted before the request failed
                self.cleanup_failed_create(&request.id).await;
                return Err(FleetError::Provision(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, instance_id = %request.id, "Failed to create server");
            // Gateways can fail a request the compute service already accepted
            self.cleanup_failed_create(&request.id).await;
            return Err(map_create_failure(status, &body));
        }

        Ok(request.id)
    }

    async fn delete(&self, id: &InstanceId) -> Result<()> {
        let Some(server) = self.find(id).await? else {
            debug!(instance_id = %id, "Server already gone");
            return Ok(());
        };

        info!(instance_id = %id, server_id = %server.id, "Deleting cloud server");
        let url = format!("{}/servers/{}", self.base_url, server.id);
        let response = self
            .client
            .delete(&url)
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(FleetError::Provision(format!(
            "delete server {}: {status} - {body}",
            server.id
        )))
    }

    async fn status(&self, id: &InstanceId) -> Result<VmStatus> {
        match self.find(id).await? {
            Some(server) => Ok(map_status(server.status.as_deref())),
            None => Err(FleetError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunnerSpec, SpecKey};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CreateRequest {
        CreateRequest {
            id: InstanceId::new(),
            spec: RunnerSpec {
                flavor: "m1.small".to_string(),
                label: "x64".to_string(),
                image: "noble".to_string(),
                desired: 1,
                backend: BackendKind::Cloud,
            },
            dedup_key: None,
            jit_config: "jit".to_string(),
            created_at: Utc::now(),
        }
    }

    fn server_json(id: &InstanceId, status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "6f2a9c1e",
            "name": id.to_string(),
            "status": status,
            "created": "2024-05-01T10:00:00Z",
            "metadata": { "runner-fleet.spec": "m1.small/x64" }
        })
    }

    #[tokio::test]
    async fn test_list_all_parses_servers() {
        let server = MockServer::start().await;
        let id = InstanceId::new();
        Mock::given(method("GET"))
            .and(path("/servers/detail"))
            .and(header("X-Auth-Token", "secret"))
            .and(query_param("name", "^runner-"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "servers": [
                    server_json(&id, "ACTIVE"),
                    { "id": "x", "name": "runner-not-a-ulid", "metadata": {} }
                ]
            })))
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        let instances = backend.list_all().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, id);
        assert_eq!(instances[0].spec, SpecKey::new("m1.small", "x64"));
    }

    #[tokio::test]
    async fn test_create_posts_server() {
        let server = MockServer::start().await;
        let req = request();
        Mock::given(method("POST"))
            .and(path("/servers"))
            .and(body_partial_json(serde_json::json!({
                "server": {
                    "name": req.id.to_string(),
                    "imageRef": "noble",
                    "flavorRef": "m1.small",
                    "networks": "auto"
                }
            })))
            .respond_with(
                ResponseTemplate::new(202)
                    .set_body_json(serde_json::json!({ "server": { "id": "6f2a9c1e" } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        assert_eq!(backend.create(&req).await.unwrap(), req.id);
    }

    #[tokio::test]
    async fn test_create_quota_exceeded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"{"forbidden": {"message": "Quota exceeded for cores"}}"#,
            ))
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        let err = backend.create(&request()).await.unwrap_err();
        assert!(matches!(err, FleetError::QuotaExceeded(_)));
        assert!(err.counts_toward_quarantine());
    }

    #[tokio::test]
    async fn test_create_bad_image_is_provision_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Image not found"))
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        let err = backend.create(&request()).await.unwrap_err();
        assert!(matches!(err, FleetError::Provision(_)));
    }

    #[tokio::test]
    async fn test_create_error_status_removes_accepted_server() {
        let server = MockServer::start().await;
        let req = request();
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream timeout"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/servers/detail"))
            .and(query_param("name", format!("^{}$", req.id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "servers": [server_json(&req.id, "BUILD")] }),
            ))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/servers/6f2a9c1e"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        let err = backend.create(&req).await.unwrap_err();
        assert!(matches!(err, FleetError::Provision(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_server_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/detail"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "servers": [] })),
            )
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        backend.delete(&InstanceId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_existing_server() {
        let server = MockServer::start().await;
        let id = InstanceId::new();
        Mock::given(method("GET"))
            .and(path("/servers/detail"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "servers": [server_json(&id, "ACTIVE")] }),
            ))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/servers/6f2a9c1e"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        backend.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        let id = InstanceId::new();
        Mock::given(method("GET"))
            .and(path("/servers/detail"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "servers": [server_json(&id, "BUILD")] }),
            ))
            .mount(&server)
            .await;

        let backend = CloudBackend::new(server.uri(), "secret", None).unwrap();
        assert_eq!(backend.status(&id).await.unwrap(), VmStatus::Provisioning);
        assert!(backend
            .status(&InstanceId::new())
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(map_status(Some("ERROR")), VmStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let backend = CloudBackend::new("http://127.0.0.1:1", "secret", None).unwrap();
        let err = backend.list_all().await.unwrap_err();
        assert!(err.is_backend_wide());
    }
}
