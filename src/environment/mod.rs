pub mod docker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Result;

/// Resource limits for a server process, as supplied by the Panel. Memory
/// figures are MiB on the wire and converted to bytes for the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    #[serde(rename = "memory")]
    pub memory_limit: i64,
    /// -1 for unlimited, 0 to disable, otherwise MiB of swap.
    pub swap: i64,
    #[serde(rename = "disk")]
    pub disk_space: i64,
    #[serde(rename = "io")]
    pub io_weight: u16,
    /// CPU limit as a percentage, 100 meaning one full core.
    #[serde(rename = "cpu")]
    pub cpu_limit: i64,
    /// cpuset pin specification, empty when unpinned.
    pub threads: String,
    pub oom_disabled: bool,
}

impl Limits {
    /// Hard memory cap in bytes. Carries 5% of headroom over the declared
    /// limit so the kernel accounts the game process, not the cap, as the
    /// thing that ran out of memory.
    pub fn bounded_memory_limit(&self) -> i64 {
        (self.memory_limit as f64 * 1.05).round() as i64 * 1_000_000
    }

    pub fn memory_reservation(&self) -> i64 {
        self.memory_limit * 1_000_000
    }

    pub fn converted_swap(&self) -> i64 {
        if self.swap < 0 {
            return -1;
        }

        (self.swap + self.memory_limit) * 1_000_000
    }

    /// CFS quota in microseconds against the fixed 100ms period; `None`
    /// leaves the container unthrottled.
    pub fn converted_cpu_limit(&self) -> Option<i64> {
        if self.cpu_limit <= 0 {
            return None;
        }

        Some(self.cpu_limit * 1_000)
    }

    pub fn cpuset(&self) -> Option<String> {
        if self.threads.trim().is_empty() {
            None
        } else {
            Some(self.threads.trim().to_string())
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationMapping {
    pub ip: String,
    pub port: u16,
}

/// The ports a server exposes, grouped by host IP, plus the designated
/// default pairing handed to the process itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Allocations {
    #[serde(rename = "default")]
    pub default_mapping: AllocationMapping,
    pub mappings: HashMap<String, Vec<u16>>,
}

impl Allocations {
    /// The default (ip, port) must appear in the mapping table.
    pub fn validate(&self) -> Result<()> {
        let ok = self
            .mappings
            .get(&self.default_mapping.ip)
            .map(|ports| ports.contains(&self.default_mapping.port))
            .unwrap_or(false);

        if !ok {
            return Err(crate::error::Error::Validation(format!(
                "default allocation {}:{} is not present in the allocation mappings",
                self.default_mapping.ip, self.default_mapping.port
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything a process environment needs to materialize a backing resource
/// for one server. Snapshotted from the Panel-supplied configuration when the
/// server object is built.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentConfiguration {
    pub invocation: String,
    pub image: String,
    pub environment: HashMap<String, String>,
    pub limits: Limits,
    pub allocations: Allocations,
    pub mounts: Vec<Mount>,
}

/// Exit information for a finished process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitState {
    pub exit_code: i64,
    pub oom_killed: bool,
}

/// The contract the server layer consumes. Implemented by the Docker-backed
/// environment; other backings only need to honor the same semantics. An
/// environment receives publish and state handles at construction and never
/// holds the server that owns it.
#[async_trait]
pub trait ProcessEnvironment: Send + Sync {
    /// Short name of the backing implementation, for logging.
    fn kind(&self) -> &'static str;

    /// Whether a backing process resource is materialized.
    async fn exists(&self) -> Result<bool>;

    /// Whether the backing resource is currently running the process.
    async fn is_running(&self) -> Result<bool>;

    /// Creates the backing resource without starting it. A no-op when the
    /// resource already exists.
    async fn create(&self, invocation: &str) -> Result<()>;

    /// Destroys any stale resource and re-creates it so configuration
    /// changes synced from the control plane take effect.
    async fn on_before_start(&self) -> Result<()>;

    /// Starts the process and attaches the console pumps. Any failure after
    /// the state moved to Starting deposits it back at Offline via Stopping.
    async fn start(&self) -> Result<()>;

    /// Gracefully stops the process according to the configured stop
    /// directive. Success when the process is already offline.
    async fn stop(&self) -> Result<()>;

    /// Stops and blocks until the process is offline or the deadline passes;
    /// on deadline either kills the process or returns a timeout error.
    async fn wait_for_stop(&self, seconds: u64, terminate: bool) -> Result<()>;

    /// Forcibly delivers the named signal. A no-op when nothing is running.
    async fn terminate(&self, signal: &str) -> Result<()>;

    /// Full stop/start cycle. Concurrent calls beyond the first return
    /// `RestartInProgress` without blocking.
    async fn restart(&self) -> Result<()>;

    /// Applies the current resource limits without a restart. A no-op when
    /// the backing resource is absent.
    async fn in_situ_update(&self) -> Result<()>;

    /// Writes `command` followed by a newline to the process input stream.
    async fn send_command(&self, command: &str) -> Result<()>;

    /// The last `bytes` bytes of the process tail log, line-split.
    async fn read_log(&self, bytes: u64) -> Result<Vec<String>>;

    /// Exit code and OOM-kill flag of the last process run.
    async fn exit_state(&self) -> Result<ExitState>;

    /// Removes the backing resource. Success when it is already gone.
    async fn destroy(&self) -> Result<()>;

    /// Starts the console pumps; returns once attachment is established.
    /// A no-op when already attached.
    async fn attach(&self) -> Result<()>;
}
