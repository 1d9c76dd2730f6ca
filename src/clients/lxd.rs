//! LXD REST client for the runner VMs.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use spaghettihub_common::VmSize;
use tracing::{debug, info};

use crate::errors::VmHostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopped,
    /// Transitional states (starting, freezing, ...).
    Other,
}

/// Image an instance is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSource {
    pub server: String,
    pub protocol: String,
    pub alias: String,
}

impl Default for ImageSource {
    fn default() -> Self {
        Self {
            server: "https://cloud-images.ubuntu.com/releases".to_string(),
            protocol: "simplestreams".to_string(),
            alias: "24.04".to_string(),
        }
    }
}

/// Everything needed to create one runner VM.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub size: VmSize,
    pub image: ImageSource,
    pub storage_pool: String,
    pub user_data: String,
}

impl InstanceSpec {
    fn to_request(&self) -> Value {
        json!({
            "name": self.name,
            "type": "virtual-machine",
            "source": {
                "type": "image",
                "mode": "pull",
                "server": self.image.server,
                "protocol": self.image.protocol,
                "alias": self.image.alias,
            },
            "config": {
                "limits.cpu": self.size.cpu_cores.to_string(),
                "limits.memory": self.size.memory.to_string(),
                "user.user-data": self.user_data,
            },
            "devices": {
                "root": {
                    "type": "disk",
                    "path": "/",
                    "pool": self.storage_pool,
                    "size": self.size.disk.to_string(),
                }
            }
        })
    }
}

/// Operations on the virtualization host, addressed by instance name.
#[async_trait]
pub trait VmHost: Send + Sync {
    /// `VmHostError::NotFound` when no such instance exists.
    async fn instance_state(&self, name: &str) -> Result<InstanceState, VmHostError>;

    /// Create the instance and wait for creation to finish. Does not start it.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), VmHostError>;

    async fn start_instance(&self, name: &str) -> Result<(), VmHostError>;

    async fn stop_instance(&self, name: &str, force: bool) -> Result<(), VmHostError>;

    async fn delete_instance(&self, name: &str) -> Result<(), VmHostError>;
}

/// Standard LXD response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Clone)]
pub struct LxdClient {
    http: reqwest::Client,
    endpoint: String,
    project: String,
    operation_timeout: Duration,
}

pub struct LxdClientBuilder {
    endpoint: String,
    project: String,
    identity_pem: Option<Vec<u8>>,
    accept_invalid_certs: bool,
    operation_timeout: Duration,
}

impl LxdClientBuilder {
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Load the TLS client certificate and key LXD trusts.
    pub fn client_certificate(mut self, cert: &Path, key: &Path) -> anyhow::Result<Self> {
        let mut pem = std::fs::read(cert)
            .with_context(|| format!("Failed to read client certificate {}", cert.display()))?;
        pem.push(b'\n');
        pem.extend(
            std::fs::read(key)
                .with_context(|| format!("Failed to read client key {}", key.display()))?,
        );
        self.identity_pem = Some(pem);
        Ok(self)
    }

    /// LXD servers usually present a self-signed certificate.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn build(self) -> anyhow::Result<LxdClient> {
        let mut http = reqwest::Client::builder().danger_accept_invalid_certs(self.accept_invalid_certs);
        if let Some(pem) = self.identity_pem {
            let identity =
                reqwest::Identity::from_pem(&pem).context("Invalid LXD client certificate")?;
            http = http.identity(identity);
        }
        Ok(LxdClient {
            http: http.build().context("Failed to build LXD HTTP client")?,
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            project: self.project,
            operation_timeout: self.operation_timeout,
        })
    }
}

impl LxdClient {
    pub fn builder(endpoint: impl Into<String>) -> LxdClientBuilder {
        LxdClientBuilder {
            endpoint: endpoint.into(),
            project: "default".to_string(),
            identity_pem: None,
            accept_invalid_certs: false,
            operation_timeout: Duration::from_secs(600),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Envelope, VmHostError> {
        let mut req = self
            .http
            .request(method, self.url(path))
            .query(&[("project", self.project.as_str())]);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let envelope = resp.json::<Envelope>().await?;

        if envelope.kind == "error" || !status.is_success() {
            let code = if envelope.error_code != 0 {
                envelope.error_code
            } else {
                status.as_u16()
            };
            if code == StatusCode::NOT_FOUND.as_u16() {
                return Err(VmHostError::NotFound(path.to_string()));
            }
            return Err(VmHostError::Api {
                status: code,
                message: envelope.error,
            });
        }
        Ok(envelope)
    }

    /// Block until a background operation finishes.
    async fn wait(&self, envelope: Envelope) -> Result<(), VmHostError> {
        if envelope.kind != "async" {
            return Ok(());
        }
        let operation = envelope.operation;
        let path = format!(
            "{}/wait?timeout={}",
            operation,
            self.operation_timeout.as_secs()
        );
        debug!(operation = %operation, "Waiting for LXD operation");
        let done = self.request(reqwest::Method::GET, &path, None).await?;
        let status = done.metadata["status"].as_str().unwrap_or_default();
        if status != "Success" {
            return Err(VmHostError::OperationFailed {
                operation,
                message: done.metadata["err"]
                    .as_str()
                    .filter(|e| !e.is_empty())
                    .unwrap_or(status)
                    .to_string(),
            });
        }
        Ok(())
    }

    async fn change_state(&self, name: &str, action: &str, force: bool) -> Result<(), VmHostError> {
        let body = json!({"action": action, "force": force, "timeout": -1});
        let envelope = self
            .request(
                reqwest::Method::PUT,
                &format!("/1.0/instances/{}/state", name),
                Some(&body),
            )
            .await
            .map_err(|e| not_found_as(e, name))?;
        self.wait(envelope).await
    }

    /// Add this client's certificate to the server trust store using the
    /// trust password, unless it is already trusted.
    pub async fn authenticate(&self, trust_password: &str) -> anyhow::Result<()> {
        let server = self
            .request(reqwest::Method::GET, "/1.0", None)
            .await
            .context("Failed to reach LXD server")?;
        if server.metadata["auth"].as_str() == Some("trusted") {
            debug!("LXD client certificate already trusted");
            return Ok(());
        }
        let body = json!({"type": "client", "password": trust_password});
        self.request(reqwest::Method::POST, "/1.0/certificates", Some(&body))
            .await
            .context("LXD rejected the trust password")?;
        info!("Registered client certificate with LXD");
        Ok(())
    }
}

/// Report a missing instance by name rather than by API path.
fn not_found_as(err: VmHostError, name: &str) -> VmHostError {
    match err {
        VmHostError::NotFound(_) => VmHostError::NotFound(name.to_string()),
        other => other,
    }
}

#[async_trait]
impl VmHost for LxdClient {
    async fn instance_state(&self, name: &str) -> Result<InstanceState, VmHostError> {
        let envelope = self
            .request(
                reqwest::Method::GET,
                &format!("/1.0/instances/{}/state", name),
                None,
            )
            .await
            .map_err(|e| not_found_as(e, name))?;
        Ok(match envelope.metadata["status"].as_str() {
            Some("Running") => InstanceState::Running,
            Some("Stopped") => InstanceState::Stopped,
            _ => InstanceState::Other,
        })
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), VmHostError> {
        let body = spec.to_request();
        let envelope = self
            .request(reqwest::Method::POST, "/1.0/instances", Some(&body))
            .await?;
        self.wait(envelope).await?;
        info!(instance = %spec.name, cpu = spec.size.cpu_cores, memory = %spec.size.memory, "Created VM");
        Ok(())
    }

    async fn start_instance(&self, name: &str) -> Result<(), VmHostError> {
        self.change_state(name, "start", false).await
    }

    async fn stop_instance(&self, name: &str, force: bool) -> Result<(), VmHostError> {
        self.change_state(name, "stop", force).await
    }

    async fn delete_instance(&self, name: &str) -> Result<(), VmHostError> {
        let envelope = self
            .request(
                reqwest::Method::DELETE,
                &format!("/1.0/instances/{}", name),
                None,
            )
            .await
            .map_err(|e| not_found_as(e, name))?;
        self.wait(envelope).await
    }
}
