mod console;
mod container;
mod power;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::ContainerInspectResponse;
use bollard::{Docker, API_DEFAULT_VERSION};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::DockerConfig;
use crate::environment::{
    EnvironmentConfiguration, ExitState, ProcessEnvironment,
};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::remote::ProcessConfiguration;
use crate::server::state::StateStore;

/// Deadline for short container-runtime calls.
const OP_DEADLINE: Duration = Duration::from_secs(10);
/// Grace period the runtime gives a container to stop on its own.
const STOP_GRACE_SECONDS: i64 = 10;
/// Image pulls get far longer than ordinary runtime calls.
const IMAGE_PULL_DEADLINE: Duration = Duration::from_secs(15 * 60);

pub const SERVICE_LABEL: (&str, &str) = ("Service", "Pterodactyl");
pub const CONTAINER_TYPE_LABEL: (&str, &str) = ("ContainerType", "server_process");

static DOCKER: OnceLock<Docker> = OnceLock::new();

/// Connects the process-wide runtime client and verifies the daemon is
/// reachable. Call once at startup, before any server object is built.
pub async fn configure_client(config: &DockerConfig) -> Result<()> {
    let docker = match &config.socket_path {
        Some(socket) => Docker::connect_with_socket(socket, 120, API_DEFAULT_VERSION)?,
        None => Docker::connect_with_socket_defaults()?,
    };

    let version = docker.version().await?;
    info!(
        version = version.version.as_deref().unwrap_or("unknown"),
        "connected to container runtime"
    );

    let _ = DOCKER.set(docker);
    Ok(())
}

pub(crate) fn client() -> Result<Docker> {
    DOCKER
        .get()
        .cloned()
        .ok_or_else(|| Error::Transport("container runtime client is not configured".to_string()))
}

/// Names and states of containers this daemon manages, identified by the
/// service label. Used at boot to report what survived a daemon restart.
pub async fn managed_containers() -> Result<Vec<(String, String)>> {
    let client = client()?;

    let options = ListContainersOptions::<String> {
        all: true,
        filters: HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", SERVICE_LABEL.0, SERVICE_LABEL.1)],
        )]),
        ..Default::default()
    };

    let containers = client.list_containers(Some(options)).await?;

    Ok(containers
        .into_iter()
        .map(|c| {
            (
                c.names.unwrap_or_default().join(","),
                c.state.unwrap_or_default(),
            )
        })
        .collect())
}

/// Runs a short container-runtime call under the standard deadline.
async fn deadline<T, F>(op: &'static str, duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::Timeout {
            op,
            seconds: duration.as_secs(),
        }),
    }
}

type InputStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Docker-backed process environment. The container is named by the server
/// id; the environment only ever holds publish and state handles, never the
/// server that owns it.
pub struct DockerEnvironment {
    /// Container name, equal to the server uuid.
    id: String,
    server_id: Uuid,
    client: Docker,
    config: EnvironmentConfiguration,
    meta: ProcessConfiguration,
    events: Arc<EventBus>,
    state: Arc<StateStore>,
    stdin: Arc<Mutex<Option<InputStream>>>,
    attached: Arc<AtomicBool>,
    restarting: AtomicBool,
    pumps: StdMutex<Vec<JoinHandle<()>>>,
}

impl DockerEnvironment {
    pub fn new(
        server_id: Uuid,
        config: EnvironmentConfiguration,
        meta: ProcessConfiguration,
        events: Arc<EventBus>,
        state: Arc<StateStore>,
    ) -> Result<Self> {
        Ok(Self {
            id: server_id.to_string(),
            server_id,
            client: client()?,
            config,
            meta,
            events,
            state,
            stdin: Arc::new(Mutex::new(None)),
            attached: Arc::new(AtomicBool::new(false)),
            restarting: AtomicBool::new(false),
            pumps: StdMutex::new(Vec::new()),
        })
    }

    pub(super) async fn inspect(&self) -> Result<ContainerInspectResponse> {
        deadline(
            "container inspect",
            OP_DEADLINE,
            self.client
                .inspect_container(&self.id, None::<InspectContainerOptions>),
        )
        .await
    }

    pub(super) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    async fn exists(&self) -> Result<bool> {
        match self.inspect().await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn is_running(&self) -> Result<bool> {
        let container = self.inspect().await?;

        Ok(container
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    async fn exit_state(&self) -> Result<ExitState> {
        let container = self.inspect().await?;
        let state = container.state.unwrap_or_default();

        Ok(ExitState {
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn send_command(&self, command: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::NotAttached);
        };

        stream.write_all(format!("{command}\n").as_bytes()).await?;
        stream.flush().await?;

        Ok(())
    }

    async fn read_log(&self, bytes: u64) -> Result<Vec<String>> {
        let container = self.inspect().await?;
        let Some(path) = container.log_path else {
            return Err(Error::NotFound(format!(
                "no log file for container {}",
                self.id
            )));
        };

        tokio::task::spawn_blocking(move || tail_lines(Path::new(&path), bytes))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

fn tail_lines(path: &Path, bytes: u64) -> Result<Vec<String>> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();

    file.seek(SeekFrom::Start(len.saturating_sub(bytes)))?;

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;

    Ok(String::from_utf8_lossy(&raw)
        .lines()
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl ProcessEnvironment for DockerEnvironment {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn exists(&self) -> Result<bool> {
        DockerEnvironment::exists(self).await
    }

    async fn is_running(&self) -> Result<bool> {
        DockerEnvironment::is_running(self).await
    }

    async fn create(&self, invocation: &str) -> Result<()> {
        DockerEnvironment::create(self, invocation).await
    }

    async fn on_before_start(&self) -> Result<()> {
        DockerEnvironment::on_before_start(self).await
    }

    async fn start(&self) -> Result<()> {
        DockerEnvironment::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        DockerEnvironment::stop(self).await
    }

    async fn wait_for_stop(&self, seconds: u64, terminate: bool) -> Result<()> {
        DockerEnvironment::wait_for_stop(self, seconds, terminate).await
    }

    async fn terminate(&self, signal: &str) -> Result<()> {
        DockerEnvironment::terminate(self, signal).await
    }

    async fn restart(&self) -> Result<()> {
        DockerEnvironment::restart(self).await
    }

    async fn in_situ_update(&self) -> Result<()> {
        DockerEnvironment::in_situ_update(self).await
    }

    async fn send_command(&self, command: &str) -> Result<()> {
        DockerEnvironment::send_command(self, command).await
    }

    async fn read_log(&self, bytes: u64) -> Result<Vec<String>> {
        DockerEnvironment::read_log(self, bytes).await
    }

    async fn exit_state(&self) -> Result<ExitState> {
        DockerEnvironment::exit_state(self).await
    }

    async fn destroy(&self) -> Result<()> {
        DockerEnvironment::destroy(self).await
    }

    async fn attach(&self) -> Result<()> {
        DockerEnvironment::attach(self).await
    }
}
