//! Health checker: background loop that probes the whole fleet.
//!
//! Every cycle fans out one task per registered instance and settles all
//! of them before the cycle completes. Each task applies its own result,
//! so a slow or hung probe never delays a sibling's update.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fleetgrid_state::{FleetEvent, HealthTransition, InstanceRegistry};

use crate::checker::{ProbeOutcome, Prober};

/// Summary of one probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Probes dispatched.
    pub probed: usize,
    /// Probes that came back healthy.
    pub healthy: usize,
    /// Health flips applied this cycle.
    pub transitions: Vec<HealthTransition>,
}

/// Periodically probes every instance in the registry.
pub struct HealthChecker {
    registry: Arc<InstanceRegistry>,
    prober: Arc<dyn Prober>,
}

impl HealthChecker {
    pub fn new(registry: Arc<InstanceRegistry>, prober: Arc<dyn Prober>) -> Self {
        Self { registry, prober }
    }

    /// Probe every instance once and wait for all probes to settle.
    pub async fn run_cycle(&self) -> CycleReport {
        let instances = self.registry.get_instances();
        let mut report = CycleReport {
            probed: instances.len(),
            ..Default::default()
        };
        if instances.is_empty() {
            return report;
        }

        let mut probes = JoinSet::new();
        for instance in instances {
            let registry = Arc::clone(&self.registry);
            let prober = Arc::clone(&self.prober);
            probes.spawn(async move {
                let outcome = prober.probe(&instance).await;
                let transition = apply_outcome(&registry, &instance.id, outcome);
                (outcome.is_healthy(), transition)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((healthy, transition)) => {
                    if healthy {
                        report.healthy += 1;
                    }
                    report.transitions.extend(transition);
                }
                Err(e) => error!(error = %e, "health probe task failed"),
            }
        }

        debug!(
            probed = report.probed,
            healthy = report.healthy,
            flips = report.transitions.len(),
            "health check cycle complete"
        );
        report
    }

    /// Run probe cycles every `interval` until `shutdown` fires.
    ///
    /// Cycle starts stay on the `interval` grid however long probes take.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "health checker started");

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
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
        info!("health checker shutting down");
    }
}

/// Record a probe outcome and publish a flip event if the flag changed.
///
/// Results for instances removed mid-probe, or arriving after shutdown,
/// are dropped by the registry.
fn apply_outcome(
    registry: &InstanceRegistry,
    instance_id: &str,
    outcome: ProbeOutcome,
) -> Option<HealthTransition> {
    let transition = registry.apply_health_report(instance_id, outcome.into_report())?;

    let event = if transition.healthy {
        info!(%instance_id, "instance recovered to healthy");
        FleetEvent::InstanceHealthy {
            instance_id: transition.instance_id.clone(),
        }
    } else {
        warn!(%instance_id, ?outcome, "instance marked unhealthy");
        FleetEvent::InstanceUnhealthy {
            instance_id: transition.instance_id.clone(),
        }
    };
    registry.events().emit(event);
    Some(transition)
}
