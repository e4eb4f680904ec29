//! Telemetry router coordination.
//!
//! The per-instance strategy gives every instance its own forwarding daemon,
//! so a router crash or restart only affects that instance. The shared
//! strategy is kept for hosts that can only run one daemon.

mod shared;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

pub use shared::{render_shared_config, SharedRouter};

use crate::cancel::Cancellation;
use crate::config::{CommandSpec, RouterConfig, RouterMode};
use crate::error::{AppError, Result};
use crate::instance::InstanceId;
use crate::ports::PortPair;
use crate::process::{ProcessHandle, Supervisor};

struct PerInstanceRouters {
    command: CommandSpec,
    settle: Duration,
    supervisor: Supervisor,
    routes: Mutex<BTreeMap<InstanceId, PortPair>>,
}

impl PerInstanceRouters {
    fn route(&self, id: InstanceId) -> Option<PortPair> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.get(&id).copied()
    }

    async fn spawn(&self, id: InstanceId, cancel: &Cancellation) -> Result<ProcessHandle> {
        let pair = self
            .route(id)
            .ok_or_else(|| AppError::instance_not_found(id))?;
        let line = self.command.render(&[
            ("udp_port", pair.udp_port.to_string()),
            ("tcp_port", pair.tcp_port.to_string()),
        ]);
        self.supervisor
            .spawn(&format!("router {}", id), &line, None, self.settle, cancel)
            .await
    }
}

enum Strategy {
    PerInstance(PerInstanceRouters),
    Shared(SharedRouter),
}

pub struct RouterCoordinator {
    strategy: Strategy,
}

impl RouterCoordinator {
    pub fn new(config: &RouterConfig, supervisor: Supervisor) -> Self {
        let strategy = match config.mode {
            RouterMode::PerInstance => Strategy::PerInstance(PerInstanceRouters {
                command: config.per_instance.clone(),
                settle: config.settle(),
                supervisor,
                routes: Mutex::new(BTreeMap::new()),
            }),
            RouterMode::Shared => {
                log::warn!(
                    "Shared router mode: adding or removing any instance restarts the router for all instances"
                );
                Strategy::Shared(SharedRouter::new(config, supervisor))
            }
        };
        Self { strategy }
    }

    pub fn mode(&self) -> RouterMode {
        match self.strategy {
            Strategy::PerInstance(_) => RouterMode::PerInstance,
            Strategy::Shared(_) => RouterMode::Shared,
        }
    }

    /// Register an instance's forwarding.
    pub async fn add_instance(&self, id: InstanceId, pair: PortPair) -> Result<()> {
        match &self.strategy {
            Strategy::PerInstance(routers) => {
                let mut routes = routers.routes.lock().unwrap_or_else(|e| e.into_inner());
                routes.insert(id, pair);
                drop(routes);
                log::debug!("Registered router route for {}: {}", id, pair);
                Ok(())
            }
            Strategy::Shared(router) => router.add_instance(id, pair).await,
        }
    }

    /// Drop an instance's forwarding. Unknown ids are ignored.
    pub async fn remove_instance(&self, id: InstanceId) -> Result<()> {
        match &self.strategy {
            Strategy::PerInstance(routers) => {
                let mut routes = routers.routes.lock().unwrap_or_else(|e| e.into_inner());
                routes.remove(&id);
                drop(routes);
                log::debug!("Deregistered router route for {}", id);
                Ok(())
            }
            Strategy::Shared(router) => router.remove_instance(id).await,
        }
    }

    /// Bring up forwarding for a registered instance.
    ///
    /// Per-instance mode returns the router process, which the caller then
    /// owns. Shared mode returns `None`; the daemon stays with the coordinator.
    pub async fn bring_up(
        &self,
        id: InstanceId,
        cancel: &Cancellation,
    ) -> Result<Option<ProcessHandle>> {
        match &self.strategy {
            Strategy::PerInstance(routers) => routers.spawn(id, cancel).await.map(Some),
            Strategy::Shared(router) => {
                router.ensure_running().await?;
                Ok(None)
            }
        }
    }

    /// Tear down shared resources no registered instance still needs.
    ///
    /// Per-instance routers belong to their controllers, so there is nothing
    /// to tear down here.
    pub async fn shutdown(&self) {
        match &self.strategy {
            Strategy::PerInstance(routers) => {
                let remaining = routers.routes.lock().unwrap_or_else(|e| e.into_inner()).len();
                if remaining > 0 {
                    log::debug!("{} per-instance route(s) still registered", remaining);
                }
            }
            Strategy::Shared(router) => router.shutdown().await,
        }
    }

    /// PID of the shared daemon. Always `None` in per-instance mode.
    pub async fn shared_daemon_pid(&self) -> Option<u32> {
        match &self.strategy {
            Strategy::PerInstance(_) => None,
            Strategy::Shared(router) => router.daemon_pid().await,
        }
    }

    pub async fn routes(&self) -> BTreeMap<InstanceId, PortPair> {
        match &self.strategy {
            Strategy::PerInstance(routers) => routers
                .routes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            Strategy::Shared(router) => router.routes().await,
        }
    }
}
