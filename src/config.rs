use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Daemon-wide configuration. Loaded once at startup and installed as an
/// explicit process singleton; the Panel remains authoritative for per-server
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub system: SystemConfig,
    pub docker: DockerConfig,
    pub remote: RemoteConfig,
    /// Mount sources a server is allowed to bind into its container.
    pub allowed_mounts: Vec<PathBuf>,
    /// Freshness window for the cached disk usage, in seconds.
    pub disk_cache_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub uid: u32,
    pub gid: u32,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub socket_path: Option<String>,
    pub network_mode: String,
    pub dns: Vec<String>,
    pub domainname: String,
    /// Registry prefix -> credentials, matched against the image reference.
    pub registries: HashMap<String, RegistryCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/roost/servers"),
            log_dir: PathBuf::from("/var/log/roost"),
            system: SystemConfig::default(),
            docker: DockerConfig::default(),
            remote: RemoteConfig::default(),
            allowed_mounts: Vec::new(),
            disk_cache_ttl: 60,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            uid: 1000,
            gid: 1000,
            timezone: "UTC".to_string(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            network_mode: "bridge".to_string(),
            dns: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            domainname: String::new(),
            registries: HashMap::new(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            token: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Installs the configuration singleton. Later calls are ignored so tests can
/// initialize defaults without racing each other.
pub fn init(config: Config) {
    let _ = CONFIG.set(config);
}

pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}
