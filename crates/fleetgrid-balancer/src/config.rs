//! Configuration for the whole load-balancing subsystem.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use fleetgrid_autoscale::ScalerConfig;
use fleetgrid_health::HealthCheckConfig;
use fleetgrid_state::events::DEFAULT_EVENT_CAPACITY;
use fleetgrid_state::{
    AutoScalingConfig, FleetError, FleetResult, InstanceSpec, LoadBalancingStrategy,
};

/// Everything a [`LoadBalancer`](crate::LoadBalancer) needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: LoadBalancingStrategy,
    pub autoscaling: AutoScalingConfig,
    pub health: HealthCheckConfig,
    pub scaler: ScalerConfig,
    /// Buffered events per subscriber before slow readers lag.
    pub event_capacity: usize,
    /// Instances registered at startup.
    pub instances: Vec<InstanceSpec>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::default(),
            autoscaling: AutoScalingConfig::default(),
            health: HealthCheckConfig::default(),
            scaler: ScalerConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            instances: Vec::new(),
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> FleetResult<()> {
        self.autoscaling.validate()?;

        if self.health.interval_secs == 0 {
            return Err(FleetError::InvalidConfig(
                "health.interval_secs must be positive".to_string(),
            ));
        }
        if self.health.timeout_ms == 0 {
            return Err(FleetError::InvalidConfig(
                "health.timeout_ms must be positive".to_string(),
            ));
        }
        if !self.health.path.starts_with('/') {
            return Err(FleetError::InvalidConfig(format!(
                "health.path must start with '/', got {:?}",
                self.health.path
            )));
        }
        if self.scaler.interval_secs == 0 {
            return Err(FleetError::InvalidConfig(
                "scaler.interval_secs must be positive".to_string(),
            ));
        }

        // Ports the synthetic provisioner may hand out, up to max_instances.
        let base = u64::from(self.scaler.provision_base_port);
        let reserved = base + 1..=base + self.autoscaling.max_instances as u64;

        let mut seen = HashSet::new();
        for spec in &self.instances {
            if !seen.insert(spec.id.as_str()) {
                return Err(FleetError::InvalidConfig(format!(
                    "duplicate instance id {:?}",
                    spec.id
                )));
            }
            if spec.host == self.scaler.provision_host && reserved.contains(&u64::from(spec.port))
            {
                return Err(FleetError::InvalidConfig(format!(
                    "instance {:?} at {}:{} overlaps scaler provision ports {}..={}",
                    spec.id,
                    spec.host,
                    spec.port,
                    reserved.start(),
                    reserved.end()
                )));
            }
        }
        Ok(())
    }
}
