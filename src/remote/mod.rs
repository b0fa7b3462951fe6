mod types;

pub use types::{
    ContainerDetails, LineMatcher, ProcessConfiguration, ServerConfiguration, ServerSettings,
    StartupConfiguration, StopConfiguration, StopType,
};

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::server::ProcessState;

static CLIENT: OnceLock<PanelClient> = OnceLock::new();

/// Installs the process-wide Panel client. Call once at startup; later calls
/// are ignored.
pub fn configure(client: PanelClient) {
    let _ = CLIENT.set(client);
}

/// The configured Panel client, if the daemon has one. Absent in tests.
pub fn client() -> Option<&'static PanelClient> {
    CLIENT.get()
}

/// Error body the Panel returns alongside non-success statuses.
#[derive(Debug, Deserialize)]
struct PanelError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    detail: String,
}

/// HTTP client for the control plane. The Panel is the authoritative source
/// of per-server configuration; credentials ride in a bearer token header.
pub struct PanelClient {
    client: Client,
    base_url: String,
    token: String,
}

impl PanelClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub async fn server_configuration(&self, uuid: Uuid) -> Result<ServerConfiguration> {
        let url = format!("{}/api/remote/servers/{uuid}", self.base_url);
        debug!(server = %uuid, %url, "fetching server configuration from panel");

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json::<ServerConfiguration>().await?),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("server {uuid}"))),
            status => Err(Self::error_from_response(status, response).await),
        }
    }

    /// Reports a container state change. Best effort; callers log failures.
    pub async fn set_container_status(&self, uuid: Uuid, state: ProcessState) -> Result<()> {
        let url = format!("{}/api/remote/servers/{uuid}/container/status", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&serde_json::json!({ "data": { "new_state": state.to_string() } }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(Self::error_from_response(status, response).await)
    }

    async fn error_from_response(status: StatusCode, response: reqwest::Response) -> Error {
        match response.json::<PanelError>().await {
            Ok(body) => Error::Transport(format!(
                "panel responded {status}: {} ({} {})",
                body.detail, body.code, body.status
            )),
            Err(_) => Error::Transport(format!("panel responded {status}")),
        }
    }
}
