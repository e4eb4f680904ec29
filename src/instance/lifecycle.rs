//! Instance lifecycle management (start/stop).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::handshake::Handshake;
use super::types::{HandshakeOutcome, InstanceId, InstanceState, InstanceStatus, Variant};
use crate::cancel::{cancellation_pair, CancelHandle, Cancellation};
use crate::config::OrchestratorConfig;
use crate::error::{AppError, ErrorKind, Result};
use crate::ports::{PortAllocator, PortPair};
use crate::process::{check_port_pair_available, ProcessHandle, Supervisor};
use crate::router::RouterCoordinator;

/// Shared collaborators every controller drives.
#[derive(Clone)]
pub struct ControllerDeps {
    pub config: Arc<OrchestratorConfig>,
    pub ports: Arc<PortAllocator>,
    pub router: Arc<RouterCoordinator>,
    pub supervisor: Supervisor,
}

struct ControllerState {
    state: InstanceState,
    lease: Option<PortPair>,
    started_at: Option<DateTime<Utc>>,
    handshake: Option<HandshakeOutcome>,
    /// In-flight start, if any.
    cancel: Option<CancelHandle>,
    retired: bool,
}

/// Processes owned by this instance. Present only while starting, running or stopping.
#[derive(Default)]
struct InstanceProcesses {
    router: Option<ProcessHandle>,
    vehicle: Option<ProcessHandle>,
}

pub struct InstanceController {
    id: InstanceId,
    variant: Variant,
    deps: ControllerDeps,
    inner: Mutex<ControllerState>,
    /// Serialises start/stop. Held across awaits.
    lifecycle: tokio::sync::Mutex<InstanceProcesses>,
}

impl InstanceController {
    /// Create a stopped controller holding `lease`, which must already be
    /// reserved in the allocator and registered with the router.
    pub fn new(id: InstanceId, variant: Variant, lease: PortPair, deps: ControllerDeps) -> Self {
        Self {
            id,
            variant,
            deps,
            inner: Mutex::new(ControllerState {
                state: InstanceState::Stopped,
                lease: Some(lease),
                started_at: None,
                handshake: None,
                cancel: None,
                retired: false,
            }),
            lifecycle: tokio::sync::Mutex::new(InstanceProcesses::default()),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    fn lock_inner(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> InstanceState {
        self.lock_inner().state
    }

    pub fn lease(&self) -> Option<PortPair> {
        self.lock_inner().lease
    }

    pub fn status(&self) -> InstanceStatus {
        let inner = self.lock_inner();
        InstanceStatus {
            id: self.id,
            variant: self.variant,
            state: inner.state,
            udp_port: inner.lease.map(|p| p.udp_port),
            tcp_port: inner.lease.map(|p| p.tcp_port),
            started_at: inner.started_at,
            handshake: inner.handshake,
            configuration_degraded: inner.handshake == Some(HandshakeOutcome::Degraded),
        }
    }

    /// Mark the controller as removed if it is stopped. Returns the lease it
    /// held, which the caller must release.
    pub(crate) fn retire(&self) -> Result<Option<PortPair>> {
        let mut inner = self.lock_inner();
        if inner.state != InstanceState::Stopped {
            return Err(AppError::invalid_state(self.id, inner.state));
        }
        inner.retired = true;
        Ok(inner.lease.take())
    }

    /// Start the instance. Any failure before the instance is running rolls
    /// everything back: processes terminated, lease released, router
    /// deregistered.
    pub async fn start(&self, deadline: Option<Duration>) -> Result<PortPair> {
        let (cancel_handle, cancel) = cancellation_pair();
        {
            let mut inner = self.lock_inner();
            if inner.retired {
                return Err(AppError::instance_not_found(self.id));
            }
            if inner.state != InstanceState::Stopped {
                return Err(AppError::invalid_state(self.id, inner.state));
            }
            inner.state = InstanceState::Starting;
            inner.cancel = Some(cancel_handle.clone());
            inner.handshake = None;
        }

        let mut processes = self.lifecycle.lock().await;
        let timer = deadline.map(|d| cancel_handle.cancel_after(d));
        log::info!("Starting {} ({})", self.id, self.variant);

        let result = self.boot(&mut processes, &cancel).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        match result {
            Ok((pair, outcome)) => {
                let mut inner = self.lock_inner();
                inner.cancel = None;
                inner.state = InstanceState::Running;
                inner.started_at = Some(Utc::now());
                inner.handshake = Some(outcome);
                drop(inner);
                if outcome == HandshakeOutcome::Degraded {
                    log::warn!("{} running with unconfigured telemetry", self.id);
                }
                log::info!("{} started ({})", self.id, pair);
                Ok(pair)
            }
            Err(e) => {
                log::error!("Failed to start {}: {}", self.id, e);
                self.lock_inner().state = InstanceState::Stopping;
                self.shutdown_processes(&mut processes).await;
                self.release_lease().await;
                let mut inner = self.lock_inner();
                inner.cancel = None;
                inner.state = InstanceState::Stopped;
                inner.started_at = None;
                Err(e)
            }
        }
    }

    /// Stop the instance. Always succeeds; stopping a stopped instance is a no-op.
    pub async fn stop(&self) {
        self.cancel_in_flight();
        let mut processes = self.lifecycle.lock().await;
        self.stop_locked(&mut processes).await;
    }

    /// Stop, then hand the port lease back and deregister the router.
    ///
    /// Both happen under the lifecycle lock, so a start issued meanwhile
    /// runs afterwards and leases again.
    pub async fn stop_and_release(&self) {
        self.cancel_in_flight();
        let mut processes = self.lifecycle.lock().await;
        self.stop_locked(&mut processes).await;
        self.release_lease().await;
    }

    fn cancel_in_flight(&self) {
        if let Some(cancel) = self.lock_inner().cancel.clone() {
            log::info!("Cancelling in-flight start of {}", self.id);
            cancel.cancel();
        }
    }

    async fn stop_locked(&self, processes: &mut InstanceProcesses) {
        let has_processes = processes.vehicle.is_some() || processes.router.is_some();
        if has_processes {
            log::info!("Stopping {}...", self.id);
            self.lock_inner().state = InstanceState::Stopping;
            self.shutdown_processes(processes).await;
        }

        let mut inner = self.lock_inner();
        // A start still waiting for the lifecycle lock owns the state from here.
        if inner.cancel.is_none() {
            inner.state = InstanceState::Stopped;
            inner.started_at = None;
            inner.handshake = None;
        }
        drop(inner);
        if has_processes {
            log::info!("{} stopped", self.id);
        }
    }

    async fn boot(
        &self,
        processes: &mut InstanceProcesses,
        cancel: &Cancellation,
    ) -> Result<(PortPair, HandshakeOutcome)> {
        cancel.check()?;
        let pair = self.ensure_lease().await?;
        self.cleanup_stale(processes, pair, cancel).await?;

        processes.router = self.deps.router.bring_up(self.id, cancel).await?;

        let config = &self.deps.config;
        let workdir = config.vehicle_workdir();
        let line = config.vehicle.command.render(&[
            ("variant", self.variant.as_str().to_string()),
            ("udp_port", pair.udp_port.to_string()),
            ("tcp_port", pair.tcp_port.to_string()),
            ("workdir", workdir.display().to_string()),
        ]);
        let vehicle = self
            .deps
            .supervisor
            .spawn(
                &format!("vehicle {}", self.id),
                &line,
                Some(workdir.as_path()),
                config.vehicle.settle(),
                cancel,
            )
            .await?;
        processes.vehicle = Some(vehicle);

        self.wait_for_boot(processes, cancel).await?;

        let outcome = match Handshake::new(self.id, &config.handshake, pair, &workdir)
            .run(cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if e.kind() == ErrorKind::ConfigurationDegraded => HandshakeOutcome::Degraded,
            Err(e) => return Err(e),
        };
        Ok((pair, outcome))
    }

    /// Re-acquire a lease released by an earlier rollback or bulk stop.
    async fn ensure_lease(&self) -> Result<PortPair> {
        if let Some(pair) = self.lease() {
            return Ok(pair);
        }
        let pair = self.deps.ports.allocate()?;
        self.lock_inner().lease = Some(pair);
        if let Err(e) = self.deps.router.add_instance(self.id, pair).await {
            log::warn!("Router registration for {} failed: {}", self.id, e);
        }
        Ok(pair)
    }

    /// Only called with the lifecycle lock held and no processes left.
    async fn release_lease(&self) {
        let Some(pair) = self.lock_inner().lease.take() else {
            return;
        };
        if let Err(e) = self.deps.router.remove_instance(self.id).await {
            log::warn!("Router deregistration for {} failed: {}", self.id, e);
        }
        self.deps.ports.release(pair);
    }

    /// Clear leftovers that could hold this instance's ports. Only processes
    /// this controller owns are ever signalled.
    async fn cleanup_stale(
        &self,
        processes: &mut InstanceProcesses,
        pair: PortPair,
        cancel: &Cancellation,
    ) -> Result<()> {
        if processes.vehicle.is_some() || processes.router.is_some() {
            log::info!("Cleaning up leftover processes for {}...", self.id);
            self.shutdown_processes(processes).await;
        }

        let policy = self.deps.config.cleanup.port_poll_policy();
        let label = format!("Port check for {}", self.id);
        let freed = policy
            .run(&label, cancel, |_| async move { check_port_pair_available(pair) })
            .await;
        match freed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Cancelled => Err(e),
            Err(e) => {
                log::warn!(
                    "{} ports still held by a process this orchestrator does not own, continuing: {}",
                    self.id,
                    e
                );
                Ok(())
            }
        }
    }

    /// Wait out the boot grace period, failing fast if a child dies.
    async fn wait_for_boot(
        &self,
        processes: &mut InstanceProcesses,
        cancel: &Cancellation,
    ) -> Result<()> {
        let vehicle = &self.deps.config.vehicle;
        let deadline = tokio::time::Instant::now() + vehicle.boot_grace();
        log::info!(
            "Waiting for {} to boot ({:?})...",
            self.id,
            vehicle.boot_grace()
        );

        loop {
            for handle in [processes.vehicle.as_mut(), processes.router.as_mut()]
                .into_iter()
                .flatten()
            {
                if !self.deps.supervisor.is_alive(handle) {
                    return Err(AppError::spawn_failure(
                        handle.label(),
                        "exited during boot",
                    ));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            cancel.sleep(vehicle.boot_poll().min(deadline - now)).await?;
        }
    }

    async fn shutdown_processes(&self, processes: &mut InstanceProcesses) {
        let supervisor = &self.deps.supervisor;
        if let Some(vehicle) = processes.vehicle.take() {
            supervisor.terminate(vehicle).await;
        }
        if let Some(router) = processes.router.take() {
            supervisor.terminate(router).await;
        }
    }
}
