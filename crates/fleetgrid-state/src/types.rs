//! Domain types for the fleet.
//!
//! These types describe backend instances, the load-balancing strategy
//! selection, and the autoscaling thresholds. All configuration types are
//! serde-serializable so the daemon can load them from TOML.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

/// Unique identifier for a backend instance.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Registration request for a backend instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpec {
    pub id: InstanceId,
    pub host: String,
    pub port: u16,
    /// Routing bias for the weighted strategy.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Capacity ceiling used as a selection filter.
    #[serde(default = "default_max_connections")]
    pub max_connections: u64,
}

impl InstanceSpec {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            max_connections: default_max_connections(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u64) -> Self {
        self.max_connections = max_connections;
        self
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_max_connections() -> u64 {
    100
}

/// Point-in-time view of a registered instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInstance {
    pub id: InstanceId,
    pub host: String,
    pub port: u16,
    pub weight: f64,
    pub current_connections: u64,
    pub max_connections: u64,
    pub healthy: bool,
    /// Unix timestamp (milliseconds) of the last probe, or registration.
    pub last_health_check: u64,
    /// Last measured probe round-trip in milliseconds.
    pub response_time: f64,
    /// CPU usage percentage reported by the instance.
    pub cpu_usage: f64,
    /// Memory usage percentage reported by the instance.
    pub memory_usage: f64,
}

impl ServerInstance {
    /// `host:port` string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Healthy and below its connection ceiling.
    pub fn is_selectable(&self) -> bool {
        self.healthy && self.current_connections < self.max_connections
    }
}

/// Resource usage reported in a health payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// Result of one health probe, as applied to the registry.
///
/// `None` fields leave the previous value in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub response_time: Option<f64>,
    pub resource_usage: Option<ResourceUsage>,
}

// ── Strategy ──────────────────────────────────────────────────────

/// Load-balancing algorithm tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyName {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
}

impl StrategyName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::LeastConnections => "least-connections",
            Self::LeastResponseTime => "least-response-time",
            Self::IpHash => "ip-hash",
        }
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm-specific options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyOptions {
    /// Seed for the weighted strategy's random draws.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Active load-balancing strategy plus its options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingStrategy {
    #[serde(default)]
    pub name: StrategyName,
    #[serde(default)]
    pub config: Option<StrategyOptions>,
}

impl LoadBalancingStrategy {
    pub fn new(name: StrategyName) -> Self {
        Self { name, config: None }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.get_or_insert_with(StrategyOptions::default).seed = Some(seed);
        self
    }

    pub fn seed(&self) -> Option<u64> {
        self.config.as_ref().and_then(|c| c.seed)
    }
}

// ── Autoscaling ───────────────────────────────────────────────────

/// One bound per scaling signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingThresholds {
    /// CPU usage percentage.
    pub cpu_usage: f64,
    /// Memory usage percentage.
    pub memory_usage: f64,
    /// Probe response time in milliseconds.
    pub response_time: f64,
    /// Mean open connections per healthy instance.
    pub connection_count: f64,
}

impl ScalingThresholds {
    fn default_scale_up() -> Self {
        Self {
            cpu_usage: 80.0,
            memory_usage: 80.0,
            response_time: 1000.0,
            connection_count: 100.0,
        }
    }

    fn default_scale_down() -> Self {
        Self {
            cpu_usage: 20.0,
            memory_usage: 20.0,
            response_time: 200.0,
            connection_count: 10.0,
        }
    }
}

/// Autoscaling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    pub min_instances: usize,
    pub max_instances: usize,
    pub scale_up_threshold: ScalingThresholds,
    pub scale_down_threshold: ScalingThresholds,
    /// Minimum seconds between two scaling actions, in either direction.
    pub cooldown_period: u64,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_instances: 1,
            max_instances: 10,
            scale_up_threshold: ScalingThresholds::default_scale_up(),
            scale_down_threshold: ScalingThresholds::default_scale_down(),
            cooldown_period: 300,
        }
    }
}

impl AutoScalingConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_period)
    }

    /// Reject bounds the control loop cannot satisfy.
    pub fn validate(&self) -> FleetResult<()> {
        if self.min_instances > self.max_instances {
            return Err(FleetError::InvalidConfig(format!(
                "min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }

        let up = &self.scale_up_threshold;
        let down = &self.scale_down_threshold;
        let pairs = [
            ("cpu_usage", down.cpu_usage, up.cpu_usage),
            ("memory_usage", down.memory_usage, up.memory_usage),
            ("response_time", down.response_time, up.response_time),
            ("connection_count", down.connection_count, up.connection_count),
        ];
        for (metric, low, high) in pairs {
            if low > high {
                return Err(FleetError::InvalidConfig(format!(
                    "scale-down {metric} threshold ({low}) is above scale-up threshold ({high})"
                )));
            }
        }
        Ok(())
    }

    /// Shallow merge: every field present in the patch replaces the
    /// current value wholesale.
    pub fn merge(&mut self, patch: AutoScalingConfigPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(min) = patch.min_instances {
            self.min_instances = min;
        }
        if let Some(max) = patch.max_instances {
            self.max_instances = max;
        }
        if let Some(up) = patch.scale_up_threshold {
            self.scale_up_threshold = up;
        }
        if let Some(down) = patch.scale_down_threshold {
            self.scale_down_threshold = down;
        }
        if let Some(cooldown) = patch.cooldown_period {
            self.cooldown_period = cooldown;
        }
    }
}

/// Partial update for [`AutoScalingConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingConfigPatch {
    pub enabled: Option<bool>,
    pub min_instances: Option<usize>,
    pub max_instances: Option<usize>,
    pub scale_up_threshold: Option<ScalingThresholds>,
    pub scale_down_threshold: Option<ScalingThresholds>,
    pub cooldown_period: Option<u64>,
}

/// Mean metrics over the healthy instance set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    /// Number of healthy instances the means were taken over.
    pub healthy_instances: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub response_time: f64,
    pub connection_count: f64,
}

impl AggregateMetrics {
    /// At least one signal is above its bound.
    pub fn exceeds_any(&self, t: &ScalingThresholds) -> bool {
        self.cpu_usage > t.cpu_usage
            || self.memory_usage > t.memory_usage
            || self.response_time > t.response_time
            || self.connection_count > t.connection_count
    }

    /// Every signal is below its bound.
    pub fn below_all(&self, t: &ScalingThresholds) -> bool {
        self.cpu_usage < t.cpu_usage
            && self.memory_usage < t.memory_usage
            && self.response_time < t.response_time
            && self.connection_count < t.connection_count
    }
}

/// Fleet-wide counts plus means over the healthy subset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InstanceStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub total_connections: u64,
    pub avg_response_time: f64,
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
}

/// Index of the first item with the smallest key.
///
/// Ties resolve to the earliest position, unlike `Iterator::min_by_key`
/// which keeps the last.
pub fn first_min_index<T>(items: &[T], key: impl Fn(&T) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, item) in items.iter().enumerate() {
        let value = key(item);
        if best.is_none_or(|(_, current)| value < current) {
            best = Some((idx, value));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Current wall-clock time in Unix milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
