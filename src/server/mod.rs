pub mod filesystem;
mod listeners;
pub mod registry;
pub mod state;
mod unarchive;

pub use filesystem::Filesystem;
pub use registry::ServerRegistry;
pub use state::{ProcessState, StateStore, StateTransition, CONSOLE_OUTPUT_EVENT, STATE_CHANGE_EVENT};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::config;
use crate::environment::docker::DockerEnvironment;
use crate::environment::{EnvironmentConfiguration, Mount, ProcessEnvironment};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::remote::{ProcessConfiguration, ServerConfiguration, ServerSettings};

/// Everything an environment implementation receives at construction: the
/// identity, its share of the server configuration, and handles for
/// publishing console output and moving the state machine. Environments
/// never hold the server that owns them.
pub struct EnvironmentParts {
    pub server_id: Uuid,
    pub configuration: EnvironmentConfiguration,
    pub process: ProcessConfiguration,
    pub events: Arc<EventBus>,
    pub state: Arc<StateStore>,
}

/// A single managed game server: its Panel-supplied configuration, state
/// machine, event bus, data directory guard, and the environment that backs
/// the actual process.
pub struct Server {
    id: Uuid,
    config: RwLock<ServerConfiguration>,
    state: Arc<StateStore>,
    events: Arc<EventBus>,
    environment: Arc<dyn ProcessEnvironment>,
    filesystem: Arc<Filesystem>,
    /// Instant of the last automatic crash restart, for cooldown.
    last_crash: Mutex<Option<Instant>>,
    transitions: Mutex<Option<UnboundedReceiver<StateTransition>>>,
}

impl Server {
    /// Builds a server backed by the Docker environment.
    pub fn from_configuration(configuration: ServerConfiguration) -> Result<Arc<Self>> {
        Self::build(configuration, |parts| {
            let env = DockerEnvironment::new(
                parts.server_id,
                parts.configuration,
                parts.process,
                parts.events,
                parts.state,
            )?;

            Ok(Arc::new(env) as Arc<dyn ProcessEnvironment>)
        })
    }

    /// Builds a server around any environment implementation. The factory
    /// receives the publish and state handles the server owns; tests use
    /// this to drive the lifecycle without a container runtime.
    pub fn build<F>(configuration: ServerConfiguration, factory: F) -> Result<Arc<Self>>
    where
        F: FnOnce(EnvironmentParts) -> Result<Arc<dyn ProcessEnvironment>>,
    {
        let id = configuration.settings.uuid;
        if id.is_nil() {
            return Err(Error::Validation("server uuid is missing".to_string()));
        }

        configuration.settings.allocations.validate()?;

        let events = Arc::new(EventBus::new());
        let (state, transitions) = StateStore::new(events.clone());

        let environment = factory(EnvironmentParts {
            server_id: id,
            configuration: environment_configuration(&configuration.settings),
            process: configuration.process_configuration.clone(),
            events: events.clone(),
            state: state.clone(),
        })?;

        let cfg = config::get();
        let filesystem = Arc::new(Filesystem::new(
            id,
            cfg.data_dir.join(id.to_string()),
            configuration.settings.build.disk_space,
            Duration::from_secs(cfg.disk_cache_ttl),
        ));

        let server = Arc::new(Self {
            id,
            config: RwLock::new(configuration),
            state,
            events,
            environment,
            filesystem,
            last_crash: Mutex::new(None),
            transitions: Mutex::new(Some(transitions)),
        });

        server.start_event_listeners();

        Ok(server)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub(crate) fn state_store(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn environment(&self) -> &Arc<dyn ProcessEnvironment> {
        &self.environment
    }

    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.filesystem
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn invocation(&self) -> String {
        self.config
            .read()
            .expect("config lock poisoned")
            .settings
            .invocation
            .clone()
    }

    pub fn suspended(&self) -> bool {
        self.config
            .read()
            .expect("config lock poisoned")
            .settings
            .suspended
    }

    pub fn process_configuration(&self) -> ProcessConfiguration {
        self.config
            .read()
            .expect("config lock poisoned")
            .process_configuration
            .clone()
    }

    pub fn crash_detection_enabled(&self) -> bool {
        self.config
            .read()
            .expect("config lock poisoned")
            .settings
            .crash_detection_enabled
    }

    fn start_event_listeners(self: &Arc<Self>) {
        listeners::spawn_console_listener(self);

        if let Some(rx) = self
            .transitions
            .lock()
            .expect("transitions lock poisoned")
            .take()
        {
            listeners::spawn_transition_listener(self, rx);
        }
    }

    pub(crate) fn last_crash(&self) -> &Mutex<Option<Instant>> {
        &self.last_crash
    }
}

/// Snapshots the environment's share of the Panel configuration. The server
/// data directory is always the first mount; the rest come from the Panel
/// and are filtered against host policy by the environment.
fn environment_configuration(settings: &ServerSettings) -> EnvironmentConfiguration {
    let mut environment = HashMap::new();
    for (key, value) in &settings.environment {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        environment.insert(key.clone(), value);
    }

    let data_dir = config::get().data_dir.join(settings.uuid.to_string());
    let mut mounts = vec![Mount {
        source: data_dir,
        target: "/home/container".to_string(),
        read_only: false,
    }];
    mounts.extend(settings.mounts.iter().cloned());

    EnvironmentConfiguration {
        invocation: settings.invocation.clone(),
        image: settings.container.image.clone(),
        environment,
        limits: settings.build.clone(),
        allocations: settings.allocations.clone(),
        mounts,
    }
}
