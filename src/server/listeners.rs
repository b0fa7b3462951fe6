use regex::Regex;
use std::borrow::Cow;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, warn};

use crate::remote;
use crate::remote::StopType;
use crate::server::state::{
    ProcessState, StateTransition, CONSOLE_OUTPUT_EVENT,
};
use crate::server::Server;

/// Minimum time between automatic restarts after a crash.
const CRASH_COOLDOWN: Duration = Duration::from_secs(60);

/// CSI/OSC sequences introduced by ESC or a single-byte CSI, with either a
/// BEL-terminated OSC payload or a parameter sequence ending in a final byte.
static STRIP_ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\x{1b}\x{9b}][\[\]()#;?]*(?:(?:(?:[a-zA-Z\d]*(?:;[a-zA-Z\d]*)*)?\x{07})|(?:(?:\d{1,4}(?:;\d{0,4})*)?[\dA-PRZcf-ntqry=><~]))",
    )
    .expect("ansi strip pattern must compile")
});

pub(crate) fn strip_ansi(input: &str) -> Cow<'_, str> {
    STRIP_ANSI.replace_all(input, "")
}

/// Subscribes the server to its own console topic and feeds each line to the
/// interpreter. The task ends when the bus is destroyed or the server is
/// dropped from the registry.
pub(super) fn spawn_console_listener(server: &Arc<Server>) {
    let Ok(mut subscription) = server.events().subscribe(CONSOLE_OUTPUT_EVENT) else {
        return;
    };

    let weak = Arc::downgrade(server);
    tokio::spawn(async move {
        while let Some(line) = subscription.recv().await {
            let Some(server) = weak.upgrade() else {
                break;
            };

            server.on_console_output(&line);
        }
    });
}

/// Watches state transitions: reports them to the Panel and runs crash
/// detection on abnormal exits.
pub(super) fn spawn_transition_listener(
    server: &Arc<Server>,
    mut transitions: UnboundedReceiver<StateTransition>,
) {
    let weak = Arc::downgrade(server);
    tokio::spawn(async move {
        while let Some(transition) = transitions.recv().await {
            let Some(server) = weak.upgrade() else {
                break;
            };

            server.on_state_transition(transition).await;
        }
    });
}

impl Server {
    /// Checks a console line against the startup and stop configuration. A
    /// matching done pattern marks a starting server as running; the echo of
    /// the configured stop command marks a running server as stopping, so a
    /// later exit is not misread as a crash.
    fn on_console_output(&self, data: &str) {
        let process = self.process_configuration();

        let line: Cow<'_, str> = if process.startup.strip_ansi {
            strip_ansi(data)
        } else {
            Cow::Borrowed(data)
        };

        if self.state() == ProcessState::Starting {
            for matcher in &process.startup.done {
                if !matcher.matches(&line) {
                    continue;
                }

                debug!(
                    server = %self.id(),
                    matched = %matcher,
                    against = %line,
                    "detected server in running state based on console line output"
                );

                self.state_store().set(ProcessState::Running);
                break;
            }
        }

        if self.state() == ProcessState::Running
            && process.stop.kind == StopType::Command
            && line.as_ref() == process.stop.value.as_str()
        {
            self.state_store().set(ProcessState::Stopping);
        }
    }

    async fn on_state_transition(&self, transition: StateTransition) {
        if let Some(panel) = remote::client() {
            if let Err(err) = panel.set_container_status(self.id(), transition.current).await {
                warn!(server = %self.id(), error = %err, "failed to report state change to panel");
            }
        }

        // An exit that did not route through Stopping was not asked for.
        if transition.current == ProcessState::Offline
            && transition.previous != ProcessState::Stopping
            && self.crash_detection_enabled()
        {
            self.handle_crash().await;
        }
    }

    async fn handle_crash(&self) {
        let exit = match self.environment().exit_state().await {
            Ok(exit) => exit,
            Err(err) => {
                warn!(
                    server = %self.id(),
                    error = %err,
                    "failed to read exit state after unexpected stop"
                );
                return;
            }
        };

        if exit.exit_code == 0 && !exit.oom_killed {
            debug!(server = %self.id(), "process exited cleanly, not handling as crash");
            return;
        }

        warn!(
            server = %self.id(),
            exit_code = exit.exit_code,
            oom_killed = exit.oom_killed,
            "server detected as crashed"
        );

        self.events().publish(
            CONSOLE_OUTPUT_EVENT,
            format!(
                "Detected server process in a crashed state! Exit code: {}, out of memory: {}",
                exit.exit_code, exit.oom_killed
            ),
        );

        {
            let mut last = self.last_crash().lock().expect("crash lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < CRASH_COOLDOWN {
                    warn!(
                        server = %self.id(),
                        "aborting automatic restart, last crash was inside the cooldown window"
                    );
                    return;
                }
            }

            *last = Some(Instant::now());
        }

        if let Err(err) = self.environment().start().await {
            error!(server = %self.id(), error = %err, "failed to restart server after crash");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        let input = "\u{1b}[32mDone (1.23s)!\u{1b}[0m For help";
        assert_eq!(strip_ansi(input), "Done (1.23s)! For help");
    }

    #[test]
    fn strips_osc_sequences() {
        let input = "\u{1b}]0;title\u{07}ready";
        assert_eq!(strip_ansi(input), "ready");
    }

    #[test]
    fn strips_single_byte_csi() {
        let input = "\u{9b}1;31mwarning";
        assert_eq!(strip_ansi(input), "warning");
    }

    #[test]
    fn leaves_plain_text_alone() {
        let input = "plain console output";
        assert_eq!(strip_ansi(input), input);
    }

    #[test]
    fn cursor_movement_is_removed() {
        let input = "\u{1b}[2Jcleared\u{1b}[H";
        assert_eq!(strip_ansi(input), "cleared");
    }
}
