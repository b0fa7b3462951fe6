use nix::unistd::{Gid, Uid};
use serde::Deserialize;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config;
use crate::error::{Error, Result};
use crate::remote;
use crate::server::Server;

/// The identity fields of a Panel create request. Everything else in the
/// request is superseded by the authoritative configuration fetched from the
/// Panel, so only what must be validated is read here.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InstallRequest {
    pub uuid: String,
    pub service: ServiceDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServiceDetails {
    pub egg: String,
}

/// One-shot bootstrap for a new server: validates the create request, builds
/// the server from the Panel's configuration, and materializes its data
/// directory and environment.
pub struct Installer {
    server: Arc<Server>,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer").finish_non_exhaustive()
    }
}

impl Installer {
    /// Validates the request payload and constructs the server object from
    /// the authoritative Panel configuration.
    pub async fn new(data: &[u8]) -> Result<Self> {
        let request: InstallRequest = serde_json::from_slice(data)?;

        let uuid = parse_uuid_v4(&request.uuid)
            .ok_or_else(|| Error::Validation("uuid provided was not in a valid format".to_string()))?;

        parse_uuid_v4(&request.service.egg).ok_or_else(|| {
            Error::Validation("service egg provided was not in a valid format".to_string())
        })?;

        let panel = remote::client()
            .ok_or_else(|| Error::Transport("panel client is not configured".to_string()))?;

        let configuration = panel.server_configuration(uuid).await?;
        let server = Server::from_configuration(configuration)?;

        Ok(Self { server })
    }

    pub fn uuid(&self) -> Uuid {
        self.server.id()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Creates the data directory with the right ownership and asks the
    /// environment to create itself. Failures are logged and left in place;
    /// the next attempt finds and reuses whatever partial state exists.
    pub async fn execute(&self) {
        let cfg = config::get();
        let path = cfg.data_dir.join(self.uuid().to_string());

        debug!(server = %self.uuid(), path = %path.display(), "creating required server data directory");
        if let Err(err) = tokio::fs::create_dir_all(&path).await {
            error!(server = %self.uuid(), path = %path.display(), error = %err, "failed to create server data directory");
            return;
        }

        if let Err(err) =
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await
        {
            error!(server = %self.uuid(), error = %err, "failed to set permissions on server data directory");
            return;
        }

        if let Err(err) = nix::unistd::chown(
            &path,
            Some(Uid::from_raw(cfg.system.uid)),
            Some(Gid::from_raw(cfg.system.gid)),
        ) {
            error!(server = %self.uuid(), error = %err, "failed to chown server data directory");
            return;
        }

        debug!(server = %self.uuid(), "creating required environment for server instance");
        if let Err(err) = self
            .server
            .environment()
            .create(&self.server.invocation())
            .await
        {
            error!(server = %self.uuid(), error = %err, "failed to create environment for server");
            return;
        }

        info!(server = %self.uuid(), "successfully created environment for server during install process");
    }
}

fn parse_uuid_v4(value: &str) -> Option<Uuid> {
    Uuid::parse_str(value)
        .ok()
        .filter(|u| u.get_version_num() == 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_version_four_uuids() {
        assert!(parse_uuid_v4("5e0f6ef4-34b2-4a9f-9b37-9f1e86fe0e4b").is_some());

        // Version 1.
        assert!(parse_uuid_v4("9f2c1a1e-7b3e-11ee-b962-0242ac120002").is_none());
        assert!(parse_uuid_v4("not-a-uuid").is_none());
        assert!(parse_uuid_v4("").is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_server_uuid() {
        let payload = serde_json::json!({
            "uuid": "garbage",
            "service": { "egg": "5e0f6ef4-34b2-4a9f-9b37-9f1e86fe0e4b" }
        });

        let err = Installer::new(payload.to_string().as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_egg_uuid() {
        let payload = serde_json::json!({
            "uuid": "5e0f6ef4-34b2-4a9f-9b37-9f1e86fe0e4b",
            "service": { "egg": "" }
        });

        let err = Installer::new(payload.to_string().as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn missing_fields_deserialize_to_defaults_and_fail_validation() {
        let err = Installer::new(b"{}").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
