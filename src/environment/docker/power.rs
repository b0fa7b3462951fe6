use bollard::container::{
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{deadline, DockerEnvironment, OP_DEADLINE, STOP_GRACE_SECONDS};
use crate::error::{Error, Result};
use crate::remote::StopType;
use crate::server::state::ProcessState;

/// Clears the restart flag when the cycle finishes, successfully or not.
struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DockerEnvironment {
    /// Always removes and re-creates the container so that configuration
    /// synced from the control plane takes effect and stale mount or
    /// environment drift cannot survive a boot.
    pub(super) async fn on_before_start(&self) -> Result<()> {
        let options = RemoveContainerOptions {
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

        self.create(&self.config.invocation).await
    }

    /// Boots the server process. A container already found running is simply
    /// re-attached, which is how the daemon recovers servers after its own
    /// restart.
    pub(super) async fn start(&self) -> Result<()> {
        match self.inspect().await {
            // Missing containers are rebuilt by on_before_start below.
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
            Ok(container) => {
                let running = container
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);

                if running {
                    self.state.set(ProcessState::Running);
                    return self.attach().await;
                }

                // Truncate the previous run's log so attach consumers are
                // not replayed stale history.
                if let Some(log_path) = container.log_path {
                    if tokio::fs::try_exists(&log_path).await.unwrap_or(false) {
                        tokio::fs::File::create(&log_path).await?;
                    }
                }
            }
        }

        self.state.set(ProcessState::Starting);

        if let Err(err) = self.start_sequence().await {
            // Through Stopping first: leaving the state at Starting would
            // hand crash detection the exact action that just failed.
            self.state.set(ProcessState::Stopping);
            self.state.set(ProcessState::Offline);
            return Err(err);
        }

        self.attach().await
    }

    async fn start_sequence(&self) -> Result<()> {
        self.on_before_start().await?;

        deadline(
            "container start",
            OP_DEADLINE,
            self.client
                .start_container(&self.id, None::<StartContainerOptions<String>>),
        )
        .await
    }

    /// Gracefully stops the process according to its stop directive. Success
    /// when the server is already offline.
    pub(super) async fn stop(&self) -> Result<()> {
        let stop = self.meta.stop.clone();

        if stop.kind == StopType::Signal {
            return self.terminate("SIGKILL").await;
        }

        if self.state.get() == ProcessState::Offline {
            return Ok(());
        }

        self.state.set(ProcessState::Stopping);

        // Prefer writing the stop command into the console; the line
        // interpreter will see its echo and keep the state machine honest.
        // Without an attached stream fall back to a runtime stop.
        if self.is_attached() && stop.kind == StopType::Command {
            return self.send_command(&stop.value).await;
        }

        let result = deadline(
            "container stop",
            Duration::from_secs(STOP_GRACE_SECONDS as u64 + 10),
            self.client.stop_container(
                &self.id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECONDS,
                }),
            ),
        )
        .await;

        match result {
            Err(Error::NotFound(_)) => {
                // The container is already gone; just mark the process as
                // stopped and carry on.
                self.attached.store(false, Ordering::Release);
                self.stdin.lock().await.take();
                self.state.set(ProcessState::Offline);
                Ok(())
            }
            other => other,
        }
    }

    /// Stops the server and blocks until it is offline or the deadline
    /// passes. On deadline the process is either killed or the caller gets a
    /// timeout error, depending on `terminate`.
    pub(super) async fn wait_for_stop(&self, seconds: u64, terminate: bool) -> Result<()> {
        self.stop().await?;

        let mut stream = self.client.wait_container(
            &self.id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        match tokio::time::timeout(Duration::from_secs(seconds), stream.next()).await {
            Err(_) => {
                if terminate {
                    return self.terminate("SIGKILL").await;
                }

                Err(Error::Timeout {
                    op: "wait for server stop",
                    seconds,
                })
            }
            Ok(None) | Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(err))) => Err(err.into()),
        }
    }

    /// Forcibly delivers the named signal. A no-op when nothing is running.
    pub(super) async fn terminate(&self, signal: &str) -> Result<()> {
        let container = match self.inspect().await {
            Err(Error::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
            Ok(container) => container,
        };

        let running = container
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        if !running {
            return Ok(());
        }

        // Stopping before Offline keeps crash detection from treating the
        // kill as an abnormal exit.
        self.state.set(ProcessState::Stopping);

        deadline(
            "container kill",
            OP_DEADLINE,
            self.client
                .kill_container(&self.id, Some(KillContainerOptions { signal })),
        )
        .await?;

        self.state.set(ProcessState::Offline);

        Ok(())
    }

    /// Waits for a graceful stop, then boots again. Only one restart cycle
    /// may run at a time; concurrent callers get `RestartInProgress`
    /// immediately rather than queueing behind the first.
    pub(super) async fn restart(&self) -> Result<()> {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::RestartInProgress);
        }

        let _guard = RestartGuard(&self.restarting);

        self.wait_for_stop(60, false).await?;
        self.start().await
    }
}
