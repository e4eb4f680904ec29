//! Spawning and terminating externally supervised process groups.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Child;

use super::control::{force_kill, graceful_signal};
use crate::cancel::Cancellation;
use crate::config::CommandLine;
use crate::error::{AppError, Result};

/// A running process group, owned by exactly one instance (or by the shared router).
///
/// Dropping a handle that was never terminated kills its group, so a panic or
/// an aborted task cannot leak children.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: u32,
    child: Child,
    reaped: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn try_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped && self.try_alive() {
            log::warn!(
                "{} (pid {}) dropped while running, killing process group",
                self.label,
                self.pid
            );
            if let Err(e) = force_kill(self.pid) {
                log::error!("Failed to kill {}: {}", self.label, e);
            }
        }
    }
}

/// Spawns children in their own process groups and tears them down with
/// SIGTERM, a bounded grace period, then SIGKILL.
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace: Duration,
}

impl Supervisor {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Launch `line` and confirm it survives `settle`.
    pub async fn spawn(
        &self,
        label: &str,
        line: &CommandLine,
        workdir: Option<&Path>,
        settle: Duration,
        cancel: &Cancellation,
    ) -> Result<ProcessHandle> {
        cancel.check()?;
        log::info!("Starting {}: {}", label, line);

        let mut cmd = line.to_command();
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::spawn_failure(label, format!("{}: {}", line.program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::spawn_failure(label, "Failed to get process ID"))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(format!("[{} stdout]", label), stdout, log::Level::Debug);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(format!("[{} stderr]", label), stderr, log::Level::Warn);
        }

        let mut handle = ProcessHandle {
            label: label.to_string(),
            pid,
            child,
            reaped: false,
        };

        if let Err(e) = cancel.sleep(settle).await {
            self.terminate(handle).await;
            return Err(e);
        }

        match handle.child.try_wait() {
            Ok(None) => {
                log::info!("{} started (pid: {})", label, pid);
                Ok(handle)
            }
            Ok(Some(status)) => {
                // Descendants may outlive the leader.
                let _ = force_kill(pid);
                handle.reaped = true;
                Err(AppError::spawn_failure(
                    label,
                    format!("exited during startup ({})", status),
                ))
            }
            Err(e) => {
                self.terminate(handle).await;
                Err(AppError::spawn_failure(label, e.to_string()))
            }
        }
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&self, handle: &mut ProcessHandle) -> bool {
        handle.try_alive()
    }

    /// Stop the whole process group. A handle that already exited is a no-op.
    pub async fn terminate(&self, mut handle: ProcessHandle) {
        let pid = handle.pid;
        handle.reaped = true;

        if !handle.try_alive() {
            let _ = force_kill(pid);
            return;
        }

        log::info!("Stopping {} (pid: {})", handle.label, pid);
        if let Err(e) = graceful_signal(pid) {
            log::warn!("Graceful signal failed for {}: {}, force killing", handle.label, e);
        } else if tokio::time::timeout(self.grace, handle.child.wait())
            .await
            .is_ok()
        {
            let _ = force_kill(pid);
            return;
        } else {
            log::warn!(
                "{} (pid {}) did not exit within {:?}, force killing",
                handle.label,
                pid,
                self.grace
            );
        }

        if let Err(e) = force_kill(pid) {
            log::error!("Failed to force kill {}: {}", handle.label, e);
        }
        if tokio::time::timeout(self.grace, handle.child.wait())
            .await
            .is_err()
        {
            log::error!("{} (pid {}) survived SIGKILL", handle.label, pid);
        }
    }
}

fn forward_output<R>(prefix: String, stream: R, level: log::Level)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            log::log!(level, "{} {}", prefix, line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation_pair;
    use crate::config::CommandSpec;
    use crate::error::ErrorKind;
    use crate::process::control::is_process_alive;

    fn line(program: &str, args: &[&str]) -> CommandLine {
        CommandSpec::new(program, args).render(&[])
    }

    #[tokio::test]
    async fn spawn_and_terminate_long_runner() {
        let supervisor = Supervisor::new(Duration::from_secs(2));
        let cancel = Cancellation::never();
        let mut handle = supervisor
            .spawn("sleeper", &line("sleep", &["30"]), None, Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        let pid = handle.pid();
        assert!(supervisor.is_alive(&mut handle));

        supervisor.terminate(handle).await;
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn early_exit_is_spawn_failure() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let err = supervisor
            .spawn("quitter", &line("false", &[]), None, Duration::from_millis(200), &Cancellation::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailure);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let err = supervisor
            .spawn(
                "ghost",
                &line("/nonexistent/sitl-binary", &[]),
                None,
                Duration::from_millis(10),
                &Cancellation::never(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailure);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_for_dead_process() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let mut handle = supervisor
            .spawn("short", &line("sleep", &["0.3"]), None, Duration::from_millis(10), &Cancellation::never())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!supervisor.is_alive(&mut handle));
        supervisor.terminate(handle).await;
    }

    #[tokio::test]
    async fn sigterm_ignorer_is_force_killed() {
        let supervisor = Supervisor::new(Duration::from_millis(200));
        let handle = supervisor
            .spawn(
                "stubborn",
                &line("sh", &["-c", "trap '' TERM; sleep 30"]),
                None,
                Duration::from_millis(50),
                &Cancellation::never(),
            )
            .await
            .unwrap();
        let pid = handle.pid();
        supervisor.terminate(handle).await;
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn cancellation_during_settle_kills_child() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let (handle, cancel) = cancellation_pair();
        let _timer = handle.cancel_after(Duration::from_millis(20));
        let err = supervisor
            .spawn("settling", &line("sleep", &["30"]), None, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
