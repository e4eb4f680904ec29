//! Shared-router strategy: one daemon for the whole fleet.
//!
//! Every registration change rewrites the daemon's config file and restarts it,
//! which drops telemetry for every other registered instance until the new
//! daemon is up.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::cancel::Cancellation;
use crate::config::{CommandSpec, RouterConfig};
use crate::error::{AppError, Result};
use crate::instance::InstanceId;
use crate::paths::ensure_parent_dir;
use crate::ports::PortPair;
use crate::process::{ProcessHandle, Supervisor};

/// Render the section-style router config for every registered forwarding.
pub fn render_shared_config(routes: &BTreeMap<InstanceId, PortPair>, log_path: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[General]");
    let _ = writeln!(out, "TcpServerPort = 0");
    let _ = writeln!(out, "ReportStats = false");
    let _ = writeln!(out, "MavlinkDialect = auto");
    let _ = writeln!(out, "Log = {}", log_path.display());

    for (id, pair) in routes {
        let _ = writeln!(out);
        let _ = writeln!(out, "[UdpEndpoint {}]", id);
        let _ = writeln!(out, "Mode = Server");
        let _ = writeln!(out, "Address = 0.0.0.0");
        let _ = writeln!(out, "Port = {}", pair.udp_port);
        let _ = writeln!(out);
        let _ = writeln!(out, "[TcpEndpoint {}_out]", id);
        let _ = writeln!(out, "Address = 127.0.0.1");
        let _ = writeln!(out, "Port = {}", pair.tcp_port);
    }
    out
}

/// Registration change that forces a daemon restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconfigure {
    Added,
    Removed,
    Revived,
}

impl Reconfigure {
    /// Registered instances, other than the one that changed, whose telemetry
    /// drops while the daemon restarts. `routes` is counted after the change.
    fn interrupted(self, routes: usize) -> usize {
        match self {
            Self::Added => routes.saturating_sub(1),
            Self::Removed => routes,
            // The old daemon was already dead.
            Self::Revived => 0,
        }
    }
}

#[derive(Default)]
struct SharedState {
    routes: BTreeMap<InstanceId, PortPair>,
    process: Option<ProcessHandle>,
}

pub struct SharedRouter {
    command: CommandSpec,
    config_path: PathBuf,
    log_path: PathBuf,
    settle: Duration,
    supervisor: Supervisor,
    state: Mutex<SharedState>,
}

impl SharedRouter {
    pub fn new(config: &RouterConfig, supervisor: Supervisor) -> Self {
        Self {
            command: config.shared.clone(),
            config_path: config.shared_config_path.clone(),
            log_path: config.log_path.clone(),
            settle: config.settle(),
            supervisor,
            state: Mutex::new(SharedState::default()),
        }
    }

    pub async fn add_instance(&self, id: InstanceId, pair: PortPair) -> Result<()> {
        let mut state = self.state.lock().await;
        state.routes.insert(id, pair);
        log::info!("Added {} to shared router: {}", id, pair);
        self.restart(&mut state, Reconfigure::Added).await
    }

    pub async fn remove_instance(&self, id: InstanceId) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(pair) = state.routes.remove(&id) else {
            return Ok(());
        };
        log::info!("Removed {} from shared router: {}", id, pair);

        if state.routes.is_empty() {
            if let Some(process) = state.process.take() {
                self.supervisor.terminate(process).await;
                log::info!("Shared router stopped, no instances left");
            }
            Ok(())
        } else {
            self.restart(&mut state, Reconfigure::Removed).await
        }
    }

    /// Restart the daemon if it died since the last reconfiguration.
    pub async fn ensure_running(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let alive = match state.process.as_mut() {
            Some(process) => self.supervisor.is_alive(process),
            None => false,
        };
        if alive || state.routes.is_empty() {
            return Ok(());
        }
        log::warn!("Shared router is not running, restarting");
        self.restart(&mut state, Reconfigure::Revived).await
    }

    /// Stop the daemon unless some instance is still registered.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if !state.routes.is_empty() {
            log::warn!(
                "Keeping shared router up for {} registered instance(s)",
                state.routes.len()
            );
            return;
        }
        if let Some(process) = state.process.take() {
            self.supervisor.terminate(process).await;
            log::info!("Shared router stopped");
        }
    }

    /// PID of the daemon, if one was spawned and not yet torn down.
    pub async fn daemon_pid(&self) -> Option<u32> {
        self.state.lock().await.process.as_ref().map(ProcessHandle::pid)
    }

    pub async fn routes(&self) -> BTreeMap<InstanceId, PortPair> {
        self.state.lock().await.routes.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    async fn restart(&self, state: &mut SharedState, change: Reconfigure) -> Result<()> {
        if let Some(process) = state.process.take() {
            let interrupted = change.interrupted(state.routes.len());
            if interrupted > 0 {
                log::warn!(
                    "Restarting shared router: telemetry for {} other instance(s) is interrupted until it is back up",
                    interrupted
                );
            } else {
                log::info!("Restarting shared router");
            }
            self.supervisor.terminate(process).await;
        }

        let content = render_shared_config(&state.routes, &self.log_path);
        ensure_parent_dir(&self.config_path)?;
        tokio::fs::write(&self.config_path, content)
            .await
            .map_err(|e| {
                AppError::io(format!(
                    "Failed to write {}: {}",
                    self.config_path.display(),
                    e
                ))
            })?;
        log::info!(
            "Generated shared router config for {} instance(s)",
            state.routes.len()
        );

        let config_arg = self.config_path.display().to_string();
        let line = self.command.render(&[("config", config_arg)]);
        let process = self
            .supervisor
            .spawn(
                "shared router",
                &line,
                None,
                self.settle,
                &Cancellation::never(),
            )
            .await?;
        state.process = Some(process);
        Ok(())
    }
}
