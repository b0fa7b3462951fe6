use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogsOptions,
    RemoveContainerOptions, UpdateContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, HostConfigLogConfig, Mount, MountTypeEnum, PortBinding};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

use super::console::LineBuffer;
use super::{deadline, DockerEnvironment, IMAGE_PULL_DEADLINE, OP_DEADLINE};
use crate::config;
use crate::error::{Error, Result};
use crate::server::state::{ProcessState, CONSOLE_OUTPUT_EVENT};

impl DockerEnvironment {
    /// Creates the container for this server. Silently succeeds when it
    /// already exists, which is what creating it would amount to anyway.
    pub(super) async fn create(&self, invocation: &str) -> Result<()> {
        match self.inspect().await {
            Ok(_) => return Ok(()),
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.ensure_image_exists().await?;

        let cfg = config::get();
        let limits = &self.config.limits;

        let container = Config::<String> {
            hostname: Some(self.id.clone()),
            domainname: (!cfg.docker.domainname.is_empty())
                .then(|| cfg.docker.domainname.clone()),
            user: Some(cfg.system.uid.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(true),
            exposed_ports: Some(self.exposed_ports()),
            image: Some(self.config.image.clone()),
            env: Some(self.environment_variables(invocation)),
            labels: Some(HashMap::from([
                (super::SERVICE_LABEL.0.to_string(), super::SERVICE_LABEL.1.to_string()),
                (
                    super::CONTAINER_TYPE_LABEL.0.to_string(),
                    super::CONTAINER_TYPE_LABEL.1.to_string(),
                ),
            ])),
            host_config: Some(HostConfig {
                port_bindings: Some(self.port_bindings()),

                // The server data directory is always the first mount; the
                // rest come from the control plane, filtered by host policy.
                mounts: Some(self.container_mounts()),

                // Games regularly need a writable, executable scratch space
                // for downloads and unpack steps.
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,exec,nosuid,size=50M".to_string(),
                )])),

                memory: Some(limits.bounded_memory_limit()),
                memory_reservation: Some(limits.memory_reservation()),
                memory_swap: Some(limits.converted_swap()),
                cpu_quota: limits.converted_cpu_limit(),
                cpu_period: Some(100_000),
                cpu_shares: Some(1024),
                cpuset_cpus: limits.cpuset(),
                blkio_weight: Some(limits.io_weight.into()),
                oom_kill_disable: Some(limits.oom_disabled),

                dns: Some(cfg.docker.dns.clone()),

                // Keep the runtime's log file small; only the tail is ever
                // read back.
                log_config: Some(HostConfigLogConfig {
                    typ: Some("json-file".to_string()),
                    config: Some(HashMap::from([
                        ("max-size".to_string(), "5m".to_string()),
                        ("max-file".to_string(), "1".to_string()),
                    ])),
                }),

                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_rootfs: Some(true),
                cap_drop: Some(
                    [
                        "setpcap",
                        "mknod",
                        "audit_write",
                        "net_raw",
                        "dac_override",
                        "fowner",
                        "fsetid",
                        "net_bind_service",
                        "sys_chroot",
                        "setfcap",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                ),
                network_mode: Some(cfg.docker.network_mode.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: self.id.as_str(),
            platform: None,
        };

        deadline(
            "container create",
            OP_DEADLINE,
            self.client.create_container(Some(options), container),
        )
        .await?;

        Ok(())
    }

    /// Starts the two console pumps and opens the input stream. Returns once
    /// attachment is established, not when the process ends. A no-op when
    /// already attached.
    pub(super) async fn attach(&self) -> Result<()> {
        if self.is_attached() {
            return Ok(());
        }

        // The attach stream misses output written in the moments before it
        // opens, so a log follower fills the gap. The two overlap and no
        // de-duplication is performed; consumers must tolerate repeats.
        self.follow_output().await?;

        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };

        let AttachContainerResults { mut output, input } =
            self.client.attach_container(&self.id, Some(options)).await?;

        *self.stdin.lock().await = Some(input);
        self.attached.store(true, Ordering::Release);

        let id = self.id.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        let stdin = self.stdin.clone();
        let attached = self.attached.clone();

        let pump = tokio::spawn(async move {
            let mut lines = LineBuffer::new();

            while let Some(item) = output.next().await {
                match item {
                    Ok(log) => lines.feed(log.into_bytes().as_ref(), |line| {
                        events.publish(CONSOLE_OUTPUT_EVENT, line)
                    }),
                    Err(err) => {
                        warn!(container = %id, error = %err, "error reading from attach stream");
                        break;
                    }
                }
            }
            lines.flush(|line| events.publish(CONSOLE_OUTPUT_EVENT, line));

            // The stream only closes when the process is gone.
            attached.store(false, Ordering::Release);
            stdin.lock().await.take();
            state.set(ProcessState::Offline);
        });

        self.pumps.lock().expect("pump lock poisoned").push(pump);

        Ok(())
    }

    /// Follows the container log from now on and republishes each line. The
    /// attach stream cannot be relied on for boot output, this follower is
    /// what captures it.
    pub(super) async fn follow_output(&self) -> Result<()> {
        if !self.exists().await? {
            return Err(Error::NotFound(format!("no such container: {}", self.id)));
        }

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since: Utc::now().timestamp(),
            ..Default::default()
        };

        let mut stream = self.client.logs(&self.id, Some(options));

        let id = self.id.clone();
        let events = self.events.clone();

        let pump = tokio::spawn(async move {
            let mut lines = LineBuffer::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(log) => lines.feed(log.into_bytes().as_ref(), |line| {
                        events.publish(CONSOLE_OUTPUT_EVENT, line)
                    }),
                    Err(err) => {
                        warn!(container = %id, error = %err, "error processing line in console output");
                        break;
                    }
                }
            }
            lines.flush(|line| events.publish(CONSOLE_OUTPUT_EVENT, line));
        });

        self.pumps.lock().expect("pump lock poisoned").push(pump);

        Ok(())
    }

    /// Applies the current resource limits to the running container without
    /// restarting it. A no-op when the container does not exist; a boot will
    /// pick the changes up instead.
    pub(super) async fn in_situ_update(&self) -> Result<()> {
        match self.inspect().await {
            Ok(_) => {}
            Err(Error::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        }

        let limits = &self.config.limits;
        let update = UpdateContainerOptions::<String> {
            memory: Some(limits.bounded_memory_limit()),
            memory_reservation: Some(limits.memory_reservation()),
            memory_swap: Some(limits.converted_swap()),
            cpu_quota: limits.converted_cpu_limit(),
            cpu_period: Some(100_000),
            cpu_shares: Some(1024),
            cpuset_cpus: limits.cpuset(),
            blkio_weight: Some(limits.io_weight.into()),
            ..Default::default()
        };

        deadline(
            "container update",
            OP_DEADLINE,
            self.client.update_container(&self.id, update),
        )
        .await?;

        Ok(())
    }

    /// Removes the container, forcibly if it is still running. Success when
    /// the container is already gone.
    pub(super) async fn destroy(&self) -> Result<()> {
        // Through Stopping first so crash detection never reads the removal
        // as an abnormal exit.
        if self.state.get() != ProcessState::Offline {
            self.state.set(ProcessState::Stopping);
        }
        self.state.set(ProcessState::Offline);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match deadline(
            "container remove",
            OP_DEADLINE,
            self.client.remove_container(&self.id, Some(options)),
        )
        .await
        {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.attached.store(false, Ordering::Release);
        self.stdin.lock().await.take();

        for pump in self.pumps.lock().expect("pump lock poisoned").drain(..) {
            pump.abort();
        }

        Ok(())
    }

    /// Pulls the configured image, falling back to a local copy of the same
    /// reference when the registry is unreachable. Remote registries have
    /// outages often enough that an existing image should never block a boot.
    pub(super) async fn ensure_image_exists(&self) -> Result<()> {
        let image = &self.config.image;

        let credentials = config::get()
            .docker
            .registries
            .iter()
            .find(|(registry, _)| image.starts_with(registry.as_str()))
            .map(|(registry, creds)| {
                debug!(%registry, "using authentication for registry");
                DockerCredentials {
                    username: Some(creds.username.clone()),
                    password: Some(creds.password.clone()),
                    ..Default::default()
                }
            });

        let options = CreateImageOptions::<String> {
            from_image: image.clone(),
            ..Default::default()
        };

        debug!(%image, "pulling image, this could take a bit of time");

        let pull = async {
            let mut stream = self.client.create_image(Some(options), None, credentials);
            while let Some(item) = stream.next().await {
                let progress = item?;
                if let Some(status) = progress.status {
                    trace!(%status, "image pull progress");
                }
            }

            Ok::<(), bollard::errors::Error>(())
        };

        let reason = match tokio::time::timeout(IMAGE_PULL_DEADLINE, pull).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!(
                "image pull did not complete within {}s",
                IMAGE_PULL_DEADLINE.as_secs()
            ),
        };

        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        for summary in images {
            if summary.repo_tags.iter().any(|tag| tag == image) {
                warn!(
                    %image,
                    container = %self.id,
                    error = %reason,
                    "unable to pull requested image from remote source, however the image exists locally"
                );
                return Ok(());
            }
        }

        Err(Error::ImagePull {
            image: image.clone(),
            reason,
        })
    }

    fn environment_variables(&self, invocation: &str) -> Vec<String> {
        let cfg = config::get();
        let allocations = &self.config.allocations;

        let mut out = vec![
            format!("TZ={}", cfg.system.timezone),
            format!("STARTUP={invocation}"),
            format!("SERVER_MEMORY={}", self.config.limits.memory_limit),
            format!("SERVER_IP={}", allocations.default_mapping.ip),
            format!("SERVER_PORT={}", allocations.default_mapping.port),
        ];

        for (key, value) in &self.config.environment {
            out.push(format!("{key}={value}"));
        }

        out
    }

    fn exposed_ports(&self) -> HashMap<String, HashMap<(), ()>> {
        let mut out = HashMap::new();

        for ports in self.config.allocations.mappings.values() {
            for port in ports {
                out.insert(format!("{port}/tcp"), HashMap::new());
                out.insert(format!("{port}/udp"), HashMap::new());
            }
        }

        out
    }

    fn port_bindings(&self) -> HashMap<String, Option<Vec<PortBinding>>> {
        let mut out: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

        for (ip, ports) in &self.config.allocations.mappings {
            for port in ports {
                for proto in ["tcp", "udp"] {
                    let binding = PortBinding {
                        host_ip: Some(ip.clone()),
                        host_port: Some(port.to_string()),
                    };

                    out.entry(format!("{port}/{proto}"))
                        .or_insert_with(|| Some(Vec::new()))
                        .get_or_insert_with(Vec::new)
                        .push(binding);
                }
            }
        }

        out
    }

    fn container_mounts(&self) -> Vec<Mount> {
        let cfg = config::get();
        let mut out = Vec::new();

        for mount in &self.config.mounts {
            let permitted = mount.source.starts_with(&cfg.data_dir)
                || cfg.allowed_mounts.iter().any(|a| mount.source.starts_with(a));

            if !permitted {
                warn!(
                    server = %self.server_id,
                    source = %mount.source.display(),
                    "skipping mount with source not permitted by host policy"
                );
                continue;
            }

            out.push(Mount {
                target: Some(mount.target.clone()),
                source: Some(mount.source.display().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(mount.read_only),
                ..Default::default()
            });
        }

        out
    }
}
