//! Autoscaler: threshold-driven instance scaling.
//!
//! Reads mean metrics over the healthy set from the registry, compares
//! them against the configured thresholds, and either provisions one
//! instance or drains and removes one. The decision itself is the pure
//! [`evaluate`] function; [`AutoScaler::run_cycle`] adds the cooldown
//! gate and performs the action.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fleetgrid_state::*;

use crate::drain::{DrainConfig, DrainOutcome, DrainPolicy, drain};
use crate::provisioner::{Provisioner, SyntheticProvisioner};

/// Control-loop schedule and drain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Seconds between scaling evaluations.
    pub interval_secs: u64,
    pub drain_timeout_secs: u64,
    pub drain_poll_ms: u64,
    pub drain_policy: DrainPolicy,
    /// Host given to synthetically provisioned instances.
    pub provision_host: String,
    /// Instance `auto-<n>` listens on `provision_base_port + n`.
    pub provision_base_port: u16,
}

impl ScalerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn drain(&self) -> DrainConfig {
        DrainConfig {
            timeout: Duration::from_secs(self.drain_timeout_secs),
            poll_interval: Duration::from_millis(self.drain_poll_ms.max(1)),
            policy: self.drain_policy,
        }
    }

    pub fn provisioner(&self) -> SyntheticProvisioner {
        SyntheticProvisioner::new(self.provision_host.clone(), self.provision_base_port)
    }
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            drain_timeout_secs: 30,
            drain_poll_ms: 1000,
            drain_policy: DrainPolicy::ForceRemove,
            provision_host: "127.0.0.1".to_string(),
            provision_base_port: 4000,
        }
    }
}

/// Direction chosen for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp,
    ScaleDown,
    NoChange,
}

/// What one control-loop cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingOutcome {
    /// Autoscaling is switched off.
    Disabled,
    /// Skipped: the previous action is too recent.
    CoolingDown { remaining: Duration },
    NoChange,
    ScaledUp { instance_id: InstanceId },
    ScaledDown {
        instance_id: InstanceId,
        drain: DrainOutcome,
    },
    /// The action was attempted and failed. The cooldown still applies.
    Failed { reason: String },
}

/// Decide a scaling direction from aggregate metrics.
///
/// Scale up on any single breach while below `max_instances`; scale down
/// only when every signal is low and above `min_instances`.
pub fn evaluate(config: &AutoScalingConfig, metrics: &AggregateMetrics) -> ScaleDecision {
    if !config.enabled {
        return ScaleDecision::NoChange;
    }

    let healthy = metrics.healthy_instances;
    if healthy < config.max_instances && metrics.exceeds_any(&config.scale_up_threshold) {
        return ScaleDecision::ScaleUp;
    }
    if healthy > config.min_instances && metrics.below_all(&config.scale_down_threshold) {
        return ScaleDecision::ScaleDown;
    }
    ScaleDecision::NoChange
}

/// The autoscaler control loop.
pub struct AutoScaler {
    registry: Arc<InstanceRegistry>,
    config: RwLock<AutoScalingConfig>,
    provisioner: Arc<dyn Provisioner>,
    drain: DrainConfig,
    /// Shared by both directions.
    last_scaling_action: Mutex<Option<Instant>>,
    /// Provisioning attempts so far.
    sequence: AtomicU64,
}

impl AutoScaler {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        config: AutoScalingConfig,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            registry,
            config: RwLock::new(config),
            provisioner,
            drain: DrainConfig::default(),
            last_scaling_action: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Override drain timing and policy.
    pub fn with_drain(mut self, drain: DrainConfig) -> Self {
        self.drain = drain;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> AutoScalingConfig {
        self.config.read().expect("scaling config lock").clone()
    }

    /// Shallow-merge a partial update and return the result.
    pub fn update_config(&self, patch: AutoScalingConfigPatch) -> AutoScalingConfig {
        let mut config = self.config.write().expect("scaling config lock");
        config.merge(patch);
        if let Err(e) = config.validate() {
            warn!(error = %e, "autoscaling config updated with inconsistent bounds");
        }
        info!(
            enabled = config.enabled,
            min = config.min_instances,
            max = config.max_instances,
            cooldown_secs = config.cooldown_period,
            "autoscaling config updated"
        );
        config.clone()
    }

    /// When the last scaling action started, if any.
    pub fn last_scaling_action(&self) -> Option<Instant> {
        *self.last_scaling_action.lock().expect("scaling timestamp lock")
    }

    /// Run one evaluation and perform the chosen action.
    pub async fn run_cycle(&self) -> ScalingOutcome {
        let config = self.config();
        if !config.enabled {
            return ScalingOutcome::Disabled;
        }

        if let Some(last) = self.last_scaling_action() {
            let elapsed = last.elapsed();
            if elapsed < config.cooldown() {
                let remaining = config.cooldown() - elapsed;
                debug!(remaining_secs = remaining.as_secs(), "scaling cooldown active");
                return ScalingOutcome::CoolingDown { remaining };
            }
        }

        let metrics = self.registry.aggregate_metrics();
        let decision = evaluate(&config, &metrics);
        debug!(
            ?decision,
            healthy = metrics.healthy_instances,
            cpu = metrics.cpu_usage,
            memory = metrics.memory_usage,
            response_time = metrics.response_time,
            connections = metrics.connection_count,
            "scaling evaluation"
        );

        let result = match decision {
            ScaleDecision::NoChange => return ScalingOutcome::NoChange,
            ScaleDecision::ScaleUp => self
                .scale_up()
                .await
                .map(|instance_id| ScalingOutcome::ScaledUp { instance_id }),
            ScaleDecision::ScaleDown => self.scale_down().await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(?decision, error = %e, "scaling action failed");
                ScalingOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Run the autoscaler loop until `shutdown` fires.
    ///
    /// Cycles start on a fixed schedule. A cycle that overruns the period
    /// delays the next one instead of bunching up missed ticks.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.registry.is_closed() {
                        break;
                    }
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        info!("autoscaler shutting down");
    }

    async fn scale_up(&self) -> FleetResult<InstanceId> {
        // Stamp first so a failing provisioner is retried at most once per cooldown.
        self.mark_action();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let spec = self
            .provisioner
            .provision(sequence)
            .await
            .map_err(|e| FleetError::Provision(format!("{}: {e:#}", self.provisioner.name())))?;
        // Re-registering would reset a live instance instead of growing the fleet.
        if self.registry.get_instance(&spec.id).is_some() {
            return Err(FleetError::Provision(format!(
                "{}: instance id {:?} is already registered",
                self.provisioner.name(),
                spec.id
            )));
        }
        let instance = self.registry.add_instance(spec)?;

        let timestamp = epoch_millis();
        info!(instance_id = %instance.id, endpoint = %instance.endpoint(), "scaled up");
        self.registry.events().emit(FleetEvent::ScaleUp {
            instance_id: instance.id.clone(),
            timestamp,
        });
        Ok(instance.id)
    }

    async fn scale_down(&self) -> FleetResult<ScalingOutcome> {
        let healthy = self.registry.get_healthy_instances();
        let Some(idx) = first_min_index(&healthy, |i| i.current_connections as f64) else {
            return Ok(ScalingOutcome::NoChange);
        };
        let instance_id = healthy[idx].id.clone();

        info!(
            %instance_id,
            connections = healthy[idx].current_connections,
            timeout_secs = self.drain.timeout.as_secs(),
            "draining instance for scale-down"
        );
        let outcome = drain(&self.registry, &instance_id, &self.drain).await;

        match outcome {
            DrainOutcome::Vanished => {
                debug!(%instance_id, "instance removed elsewhere during drain");
                return Ok(ScalingOutcome::NoChange);
            }
            DrainOutcome::TimedOut { remaining, .. } => match self.drain.policy {
                DrainPolicy::ForceRemove => {
                    warn!(
                        %instance_id,
                        remaining,
                        "drain timed out, removing with open connections"
                    );
                }
                DrainPolicy::Abort => {
                    self.mark_action();
                    return Err(FleetError::DrainAborted {
                        instance_id,
                        connections: remaining,
                    });
                }
            },
            DrainOutcome::Drained { .. } => {}
        }

        self.registry.remove_instance(&instance_id);
        self.mark_action();

        let timestamp = epoch_millis();
        info!(%instance_id, "scaled down");
        self.registry.events().emit(FleetEvent::ScaleDown {
            instance_id: instance_id.clone(),
            timestamp,
        });
        Ok(ScalingOutcome::ScaledDown {
            instance_id,
            drain: outcome,
        })
    }

    fn mark_action(&self) {
        *self.last_scaling_action.lock().expect("scaling timestamp lock") = Some(Instant::now());
    }
}
