//! REST implementation of [`Backend`].

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use studio_auth::Principal;
use studio_core::{JobId, MachineClass, MachineId, StudioId, StudioIdentity, UserId, VolumeId};

use crate::backend::Backend;
use crate::error::{BackendError, Result};
use crate::types::{
    CommandOutput, JobRecord, LaunchRequest, MachineInfo, MachineRequest, MachineStatus,
    StudioRecord,
};

/// Configuration for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL of the platform API.
    pub base_url: String,
    /// Per-request timeout in seconds. Command execution uses its own deadline.
    pub request_timeout_secs: u64,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.studio.dev".to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

impl HttpBackendConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `STUDIO_API_URL`: Base URL of the platform API
    /// - `STUDIO_REQUEST_TIMEOUT_SECS`: Per-request timeout
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("STUDIO_API_URL") {
            config.base_url = val;
        }
        if let Ok(val) = std::env::var("STUDIO_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.request_timeout_secs = secs;
            }
        }

        config
    }
}

/// Backend client speaking the platform's REST API.
///
/// Every request carries the principal's user ID and API key as basic auth.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    principal: Principal,
}

/// Error response from the platform.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VolumeResponse {
    volume_id: VolumeId,
}

#[derive(Debug, Deserialize)]
struct MachineResponse {
    machine_id: MachineId,
}

#[derive(Debug, Deserialize)]
struct CapacityResponse {
    available: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileBody {
    contents: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
}

impl HttpBackend {
    /// Create a new backend client.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(config: &HttpBackendConfig, principal: Principal) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self::with_client(client, config.base_url.clone(), principal)
    }

    /// Create a backend client with a custom reqwest client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        principal: Principal,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            principal,
        }
    }

    /// Get the base URL of the platform API.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(
            self.principal.user_id().to_string(),
            Some(self.principal.api_key().expose()),
        )
    }

    /// Send a request, returning the response whatever its status.
    async fn send_raw(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        self.authed(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(e.to_string())
            } else {
                BackendError::Transport(format!("Backend request failed: {e}"))
            }
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = self.send_raw(builder).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::Serialization(format!("Failed to parse response: {e}")))
    }

    async fn send_optional<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>> {
        match self.send_json(builder).await {
            Ok(value) => Ok(Some(value)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn error_from(response: reqwest::Response) -> BackendError {
        let (status, code, message) = Self::read_error(response).await;
        Self::classify(status, code.as_deref(), message)
    }

    async fn read_error(response: reqwest::Response) -> (StatusCode, Option<String>, String) {
        let status = response.status();
        let body = response.json::<ErrorResponse>().await.ok();
        let code = body.as_ref().and_then(|b| b.code.clone());
        let message = body
            .map(|b| b.error)
            .unwrap_or_else(|| format!("Backend returned status {status}"));

        tracing::debug!(status = %status, code = ?code, error = %message, "Backend error");
        (status, code, message)
    }

    fn classify(status: StatusCode, code: Option<&str>, message: String) -> BackendError {
        match (status, code) {
            (StatusCode::NOT_FOUND, _) => BackendError::NotFound(message),
            (_, Some("NO_CAPACITY")) => BackendError::Unavailable(message),
            (StatusCode::CONFLICT, _) => BackendError::Conflict(message),
            (StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT, _) => {
                BackendError::Timeout(message)
            }
            (s, _) if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                BackendError::Unavailable(message)
            }
            (s, _) => BackendError::Rejected {
                status: s.as_u16(),
                message,
            },
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn put_studio(&self, record: &StudioRecord) -> Result<()> {
        let url = self.url(&format!("/studios/{}", record.studio_id));
        self.send(self.client.put(&url).json(record)).await?;
        tracing::debug!(studio = %record.identity, state = %record.state, "Stored studio");
        Ok(())
    }

    async fn get_studio(&self, studio_id: &StudioId) -> Result<Option<StudioRecord>> {
        let url = self.url(&format!("/studios/{studio_id}"));
        self.send_optional(self.client.get(&url)).await
    }

    async fn find_studio(&self, identity: &StudioIdentity) -> Result<Option<StudioRecord>> {
        let url = self.url("/studios");
        let query = [
            ("org", identity.org()),
            ("teamspace", identity.teamspace()),
            ("name", identity.name()),
        ];
        let studios: Vec<StudioRecord> =
            self.send_json(self.client.get(&url).query(&query)).await?;
        Ok(studios.into_iter().find(|s| &s.identity == identity))
    }

    async fn list_studios(&self, teamspace: &str, org: &str) -> Result<Vec<StudioRecord>> {
        let url = self.url("/studios");
        let query = [("org", org), ("teamspace", teamspace)];
        self.send_json(self.client.get(&url).query(&query)).await
    }

    async fn delete_studio(&self, studio_id: &StudioId) -> Result<()> {
        let url = self.url(&format!("/studios/{studio_id}"));
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn create_volume(&self) -> Result<VolumeId> {
        let url = self.url("/volumes");
        let resp: VolumeResponse = self.send_json(self.client.post(&url)).await?;
        Ok(resp.volume_id)
    }

    async fn clone_volume(&self, source: &VolumeId) -> Result<VolumeId> {
        let url = self.url(&format!("/volumes/{source}/clone"));
        let resp: VolumeResponse = self.send_json(self.client.post(&url)).await?;
        Ok(resp.volume_id)
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()> {
        let url = self.url(&format!("/volumes/{volume_id}"));
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn write_file(&self, volume_id: &VolumeId, path: &str, contents: &[u8]) -> Result<()> {
        let url = self.url(&format!("/volumes/{volume_id}/files"));
        let body = FileBody {
            contents: BASE64_STANDARD.encode(contents),
        };
        self.send(self.client.put(&url).query(&[("path", path)]).json(&body))
            .await?;
        Ok(())
    }

    async fn read_file(&self, volume_id: &VolumeId, path: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("/volumes/{volume_id}/files"));
        let body: FileBody = self
            .send_json(self.client.get(&url).query(&[("path", path)]))
            .await?;
        BASE64_STANDARD
            .decode(body.contents)
            .map_err(|e| BackendError::Serialization(format!("invalid base64: {e}")))
    }

    async fn list_files(&self, volume_id: &VolumeId) -> Result<Vec<String>> {
        let url = self.url(&format!("/volumes/{volume_id}/files"));
        let list: FileList = self.send_json(self.client.get(&url)).await?;
        Ok(list.paths)
    }

    async fn request_machine(&self, request: &MachineRequest) -> Result<MachineId> {
        let url = self.url("/machines");
        let response = self.send_raw(self.client.post(&url).json(request)).await?;
        if !response.status().is_success() {
            let (status, code, message) = Self::read_error(response).await;
            return Err(match code.as_deref() {
                Some("NO_CAPACITY") => BackendError::NoCapacity(request.class.clone()),
                code => Self::classify(status, code, message),
            });
        }

        let resp: MachineResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Serialization(format!("Failed to parse response: {e}")))?;
        tracing::debug!(
            machine_id = %resp.machine_id,
            machine = %request.class,
            "Requested machine"
        );
        Ok(resp.machine_id)
    }

    async fn machine_status(&self, machine_id: &MachineId) -> Result<MachineStatus> {
        let url = self.url(&format!("/machines/{machine_id}"));
        self.send_json(self.client.get(&url)).await
    }

    async fn release_machine(&self, machine_id: &MachineId) -> Result<()> {
        let url = self.url(&format!("/machines/{machine_id}"));
        self.send(self.client.delete(&url)).await?;
        tracing::debug!(machine_id = %machine_id, "Released machine");
        Ok(())
    }

    async fn list_job_machines(&self, job_id: &JobId) -> Result<Vec<MachineInfo>> {
        let url = self.url("/machines");
        self.send_json(
            self.client
                .get(&url)
                .query(&[("job_id", job_id.to_string())]),
        )
        .await
    }

    async fn available_capacity(&self, class: &MachineClass) -> Result<u32> {
        let url = self.url(&format!("/capacity/{class}"));
        let resp: CapacityResponse = self.send_json(self.client.get(&url)).await?;
        Ok(resp.available)
    }

    async fn execute(&self, machine_id: &MachineId, command: &str) -> Result<CommandOutput> {
        let url = self.url(&format!("/machines/{machine_id}/exec"));
        // The caller bounds the wait; lift the default per-request timeout.
        let request = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(24 * 60 * 60))
            .json(&ExecRequest { command });
        self.send_json(request).await
    }

    async fn put_job(&self, record: &JobRecord) -> Result<()> {
        let url = self.url(&format!("/jobs/{}", record.job_id));
        self.send(self.client.put(&url).json(record)).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let url = self.url(&format!("/jobs/{job_id}"));
        self.send_optional(self.client.get(&url)).await
    }

    async fn list_jobs(
        &self,
        owner: &UserId,
        studio_id: Option<&StudioId>,
    ) -> Result<Vec<JobRecord>> {
        let url = self.url("/jobs");
        let mut query = vec![("owner", owner.to_string())];
        if let Some(studio_id) = studio_id {
            query.push(("studio_id", studio_id.to_string()));
        }
        self.send_json(self.client.get(&url).query(&query)).await
    }

    async fn launch_job(&self, request: &LaunchRequest) -> Result<()> {
        let url = self.url(&format!("/jobs/{}/launch", request.job_id));
        self.send(self.client.post(&url).json(request)).await?;
        Ok(())
    }

    async fn stop_job(&self, job_id: &JobId) -> Result<()> {
        let url = self.url(&format!("/jobs/{job_id}/stop"));
        self.send(self.client.post(&url)).await?;
        Ok(())
    }
}
