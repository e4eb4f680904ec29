//! Top-level instance registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;

use crate::config::OrchestratorConfig;
use crate::error::{AppError, Result};
use crate::instance::{
    ControllerDeps, FleetSnapshot, InstanceController, InstanceId, InstanceState, InstanceStatus,
    Variant,
};
use crate::ports::{PortAllocator, PortPair};
use crate::process::Supervisor;
use crate::router::RouterCoordinator;
use crate::validation::parse_variant;

#[derive(Default)]
struct Table {
    next_id: u64,
    instances: HashMap<InstanceId, Arc<InstanceController>>,
}

/// Owns every instance controller and the resources they share.
pub struct Orchestrator {
    deps: ControllerDeps,
    table: Mutex<Table>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let supervisor = Supervisor::new(config.shutdown.grace());
        let router = RouterCoordinator::new(&config.router, supervisor.clone());
        let ports = PortAllocator::new(&config.ports);
        log::info!(
            "Orchestrator ready: up to {} instance(s), router mode {:?}",
            ports.max_instances(),
            router.mode()
        );
        Self {
            deps: ControllerDeps {
                config: Arc::new(config),
                ports: Arc::new(ports),
                router: Arc::new(router),
                supervisor,
            },
            table: Mutex::new(Table::default()),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.deps.ports
    }

    pub fn router(&self) -> &RouterCoordinator {
        &self.deps.router
    }

    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn controller(&self, id: InstanceId) -> Result<Arc<InstanceController>> {
        self.lock_table()
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::instance_not_found(id))
    }

    /// Register a new stopped instance and reserve its ports.
    pub async fn create(&self, variant: &str) -> Result<InstanceId> {
        let variant = parse_variant(variant)?;
        let (id, pair) = {
            let mut table = self.lock_table();
            let pair = self.deps.ports.allocate()?;
            table.next_id += 1;
            let id = InstanceId(table.next_id);
            let controller = InstanceController::new(id, variant, pair, self.deps.clone());
            table.instances.insert(id, Arc::new(controller));
            (id, pair)
        };

        self.register_route(id, pair).await;
        log::info!("Created {} ({}, {})", id, variant, pair);
        Ok(id)
    }

    /// Register a freshly created instance with the router. A `remove` that
    /// ran before the registration landed found nothing to deregister, so
    /// the route is withdrawn again here.
    async fn register_route(&self, id: InstanceId, pair: PortPair) {
        if let Err(e) = self.deps.router.add_instance(id, pair).await {
            log::warn!("Router registration for {} failed: {}", id, e);
        }
        let still_present = self.lock_table().instances.contains_key(&id);
        if !still_present {
            log::info!("{} was removed during registration, withdrawing its route", id);
            if let Err(e) = self.deps.router.remove_instance(id).await {
                log::warn!("Router deregistration for {} failed: {}", id, e);
            }
        }
    }

    pub async fn start(&self, id: InstanceId) -> Result<PortPair> {
        self.start_with_deadline(id, None).await
    }

    /// Start on a worker task. Dropping the returned future does not abort the
    /// start, so rollback always runs to completion.
    pub async fn start_with_deadline(
        &self,
        id: InstanceId,
        deadline: Option<Duration>,
    ) -> Result<PortPair> {
        let controller = self.controller(id)?;
        tokio::spawn(async move { controller.start(deadline).await })
            .await
            .map_err(|e| AppError::process(format!("Start task for {} failed: {}", id, e)))?
    }

    pub async fn stop(&self, id: InstanceId) -> Result<()> {
        let controller = self.controller(id)?;
        tokio::spawn(async move { controller.stop().await })
            .await
            .map_err(|e| AppError::process(format!("Stop task for {} failed: {}", id, e)))
    }

    /// Delete a stopped instance and return its ports to the pool.
    pub async fn remove(&self, id: InstanceId) -> Result<()> {
        {
            let mut table = self.lock_table();
            let controller = table
                .instances
                .get(&id)
                .ok_or_else(|| AppError::instance_not_found(id))?;
            let lease = controller.retire()?;
            table.instances.remove(&id);
            if let Some(pair) = lease {
                self.deps.ports.release(pair);
            }
        }

        if let Err(e) = self.deps.router.remove_instance(id).await {
            log::warn!("Router deregistration for {} failed: {}", id, e);
        }
        log::info!("Removed {}", id);
        Ok(())
    }

    /// Stop everything, release every lease and tear down router resources.
    pub async fn stop_all(&self) {
        let controllers: Vec<_> = self.lock_table().instances.values().cloned().collect();
        log::info!("Stopping all {} instance(s)...", controllers.len());

        let tasks = controllers.into_iter().map(|controller| {
            tokio::spawn(async move { controller.stop_and_release().await })
        });
        for result in join_all(tasks).await {
            if let Err(e) = result {
                log::error!("Stop task failed: {}", e);
            }
        }

        self.deps.router.shutdown().await;
        log::info!("All instances stopped");
    }

    pub fn status(&self, id: InstanceId) -> Result<InstanceStatus> {
        self.controller(id).map(|controller| controller.status())
    }

    pub fn list(&self) -> FleetSnapshot {
        let mut instances: Vec<_> = self
            .lock_table()
            .instances
            .values()
            .map(|controller| controller.status())
            .collect();
        instances.sort_by_key(|status| status.id);

        let running = instances
            .iter()
            .filter(|status| status.state == InstanceState::Running)
            .count();
        FleetSnapshot {
            total: instances.len(),
            running,
            instances,
        }
    }

    pub fn variants(&self) -> &'static [Variant] {
        &Variant::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;
    use crate::error::ErrorKind;

    fn config(max_instances: usize) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.ports.udp_base = 46100;
        config.ports.tcp_base = 46200;
        config.ports.max_instances = max_instances;
        config.vehicle.workdir = std::env::temp_dir();
        config.vehicle.command = CommandSpec::new("sleep", &["30"]);
        config.vehicle.settle_ms = 20;
        config.vehicle.boot_grace_ms = 50;
        config.vehicle.boot_poll_ms = 10;
        config.router.per_instance = CommandSpec::new("sleep", &["30"]);
        config.router.settle_ms = 20;
        config.handshake.probe = CommandSpec::new("true", &[]);
        config.handshake.stabilize_ms = 0;
        config.handshake.verify_delay_ms = 0;
        config.cleanup.port_poll_attempts = 1;
        config.shutdown.grace_ms = 1_000;
        config
    }

    #[tokio::test]
    async fn create_validates_before_allocating() {
        let orchestrator = Orchestrator::new(config(2));
        let err = orchestrator.create("gz_submarine").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(orchestrator.ports().in_use(), 0);
        assert_eq!(orchestrator.list().total, 0);
    }

    #[tokio::test]
    async fn ids_are_sequential_and_listed_in_order() {
        let orchestrator = Orchestrator::new(config(3));
        let a = orchestrator.create("gz_x500").await.unwrap();
        let b = orchestrator.create("gz_tiltrotor").await.unwrap();
        assert_eq!((a, b), (InstanceId(1), InstanceId(2)));

        let snapshot = orchestrator.list();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.running, 0);
        let ids: Vec<_> = snapshot.instances.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(snapshot.instances[1].variant, Variant::Tiltrotor);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let orchestrator = Orchestrator::new(config(1));
        let id = InstanceId(42);
        assert_eq!(orchestrator.start(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(orchestrator.stop(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(orchestrator.remove(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(orchestrator.status(id).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn stop_all_releases_every_lease() {
        let orchestrator = Orchestrator::new(config(3));
        let a = orchestrator.create("gz_x500").await.unwrap();
        orchestrator.create("gz_rc_cessna").await.unwrap();
        orchestrator.start(a).await.unwrap();
        assert_eq!(orchestrator.list().running, 1);

        orchestrator.stop_all().await;
        assert_eq!(orchestrator.ports().in_use(), 0);
        assert!(orchestrator.router().routes().await.is_empty());
        let snapshot = orchestrator.list();
        assert_eq!(snapshot.running, 0);
        assert!(snapshot.instances.iter().all(|s| s.ports().is_none()));

        // Instances survive a bulk stop and lease again on start.
        let pair = orchestrator.start(a).await.unwrap();
        assert_eq!(pair, PortPair::new(46100, 46200));
        orchestrator.stop_all().await;
    }

    #[tokio::test]
    async fn route_of_instance_removed_mid_registration_is_withdrawn() {
        let orchestrator = Orchestrator::new(config(2));
        let pair = PortPair::new(46100, 46200);

        // Nothing in the table carries this id any more.
        orchestrator.register_route(InstanceId(7), pair).await;
        assert!(orchestrator.router().routes().await.is_empty());

        let id = orchestrator.create("gz_x500").await.unwrap();
        assert_eq!(orchestrator.router().routes().await.get(&id), Some(&pair));
    }
}
