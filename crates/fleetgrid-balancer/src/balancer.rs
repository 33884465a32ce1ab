//! The load balancer facade.
//!
//! Owns the registry, the active selector, and both background loops.
//! All public operations are synchronous except the loops themselves,
//! which run as tokio tasks between [`LoadBalancer::start`] and
//! [`LoadBalancer::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use fleetgrid_autoscale::{AutoScaler, Provisioner};
use fleetgrid_health::{HealthChecker, HttpProber, Prober};
use fleetgrid_state::{
    AutoScalingConfig, AutoScalingConfigPatch, EventBus, FleetEvent, FleetResult, InstanceRegistry,
    InstanceSpec, InstanceStats, LoadBalancingStrategy, ServerInstance,
};

use crate::config::BalancerConfig;
use crate::strategy::{Selector, build_selector};

struct ActiveStrategy {
    strategy: LoadBalancingStrategy,
    selector: Arc<dyn Selector>,
}

impl ActiveStrategy {
    fn new(strategy: LoadBalancingStrategy) -> Self {
        let selector = Arc::from(build_selector(&strategy));
        Self { strategy, selector }
    }
}

/// Fleet load balancer with health checking and autoscaling.
pub struct LoadBalancer {
    config: BalancerConfig,
    registry: Arc<InstanceRegistry>,
    active: RwLock<ActiveStrategy>,
    health: Arc<HealthChecker>,
    scaler: Arc<AutoScaler>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl LoadBalancer {
    /// Build a balancer with its own event bus sized from the config.
    pub fn from_config(config: BalancerConfig) -> FleetResult<Self> {
        let events = EventBus::new(config.event_capacity);
        Self::new(config, events)
    }

    /// Build a balancer that publishes on `events`.
    ///
    /// Instances listed in the config are registered immediately as
    /// healthy. Probing uses HTTP and scale-up uses a synthetic
    /// provisioner until overridden with [`with_prober`](Self::with_prober)
    /// or [`with_provisioner`](Self::with_provisioner).
    pub fn new(config: BalancerConfig, events: EventBus) -> FleetResult<Self> {
        config.validate()?;

        let registry = Arc::new(InstanceRegistry::new(events));
        for spec in &config.instances {
            registry.add_instance(spec.clone())?;
        }

        let prober: Arc<dyn Prober> = Arc::new(HttpProber::from_config(&config.health));
        let health = Arc::new(HealthChecker::new(Arc::clone(&registry), prober));
        let provisioner: Arc<dyn Provisioner> = Arc::new(config.scaler.provisioner());
        let scaler = Arc::new(
            AutoScaler::new(Arc::clone(&registry), config.autoscaling.clone(), provisioner)
                .with_drain(config.scaler.drain()),
        );

        info!(
            strategy = %config.strategy.name,
            instances = registry.len(),
            autoscaling = config.autoscaling.enabled,
            "load balancer created"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            active: RwLock::new(ActiveStrategy::new(config.strategy.clone())),
            config,
            registry,
            health,
            scaler,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Replace the health prober. Call before [`start`](Self::start).
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.health = Arc::new(HealthChecker::new(Arc::clone(&self.registry), prober));
        self
    }

    /// Replace the scale-up provisioner. Call before [`start`](Self::start).
    ///
    /// The current autoscaling config carries over.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.scaler = Arc::new(
            AutoScaler::new(Arc::clone(&self.registry), self.scaler.config(), provisioner)
                .with_drain(self.config.scaler.drain()),
        );
        self
    }

    /// Spawn the health-check and autoscaling loops.
    ///
    /// Must be called from within a tokio runtime. Repeat calls, and calls
    /// after shutdown, do nothing.
    pub fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let health_interval = self.config.health.interval();
        let scaler_interval = self.config.scaler.interval();

        let health = Arc::clone(&self.health);
        let health_rx = self.shutdown_tx.subscribe();
        let health_task = tokio::spawn(async move { health.run(health_interval, health_rx).await });

        let scaler = Arc::clone(&self.scaler);
        let scaler_rx = self.shutdown_tx.subscribe();
        let scaler_task = tokio::spawn(async move { scaler.run(scaler_interval, scaler_rx).await });

        self.tasks
            .lock()
            .expect("balancer tasks lock")
            .extend([health_task, scaler_task]);
        info!(
            health_interval_secs = health_interval.as_secs(),
            scaler_interval_secs = scaler_interval.as_secs(),
            "load balancer started"
        );
    }

    /// Stop both loops, refuse further registrations, and detach every
    /// event subscriber. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().expect("balancer tasks lock").drain(..) {
            task.abort();
        }
        self.registry.close();
        self.registry.events().close();
        info!("load balancer shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ── Registry operations ──────────────────────────────────────

    /// Register an instance, or replace the one with the same id.
    pub fn add_instance(&self, spec: InstanceSpec) -> FleetResult<ServerInstance> {
        self.registry.add_instance(spec)
    }

    pub fn remove_instance(&self, id: &str) -> Option<ServerInstance> {
        self.registry.remove_instance(id)
    }

    /// Pick an instance for one unit of work.
    ///
    /// Only healthy instances below their connection cap are considered.
    /// `client_key` is used by ip-hash and ignored by the other strategies.
    pub fn select_instance(&self, client_key: Option<&str>) -> Option<ServerInstance> {
        let mut candidates = self.registry.selectable_instances();
        if candidates.is_empty() {
            debug!("no selectable instance");
            return None;
        }

        let selector = Arc::clone(&self.active.read().expect("strategy lock").selector);
        let idx = selector.select(&candidates, client_key)?;
        if idx < candidates.len() {
            Some(candidates.swap_remove(idx))
        } else {
            None
        }
    }

    /// Returns the new count, or `None` for an unknown id.
    pub fn increment_connections(&self, id: &str) -> Option<u64> {
        self.registry.increment_connections(id)
    }

    /// Returns the new count, floored at zero, or `None` for an unknown id.
    pub fn decrement_connections(&self, id: &str) -> Option<u64> {
        self.registry.decrement_connections(id)
    }

    pub fn get_instances(&self) -> Vec<ServerInstance> {
        self.registry.get_instances()
    }

    pub fn get_healthy_instances(&self) -> Vec<ServerInstance> {
        self.registry.get_healthy_instances()
    }

    pub fn get_instance_stats(&self) -> InstanceStats {
        self.registry.instance_stats()
    }

    // ── Configuration ────────────────────────────────────────────

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.active.read().expect("strategy lock").strategy.clone()
    }

    /// Switch strategy. The new selector starts with fresh cursor state.
    pub fn update_strategy(&self, strategy: LoadBalancingStrategy) {
        let name = strategy.name;
        *self.active.write().expect("strategy lock") = ActiveStrategy::new(strategy);
        info!(strategy = %name, "load balancing strategy updated");
    }

    pub fn auto_scaling_config(&self) -> AutoScalingConfig {
        self.scaler.config()
    }

    /// Shallow-merge `patch` into the autoscaling config.
    pub fn update_auto_scaling_config(&self, patch: AutoScalingConfigPatch) -> AutoScalingConfig {
        self.scaler.update_config(patch)
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.registry.events().subscribe()
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn autoscaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
