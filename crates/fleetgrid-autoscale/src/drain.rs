//! Connection draining before instance removal.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use fleetgrid_state::InstanceRegistry;

/// What to do when connections remain at the drain deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainPolicy {
    /// Remove the instance anyway. In-flight requests may be cut off.
    #[default]
    ForceRemove,
    /// Keep the instance and report the scale-down as failed.
    Abort,
}

/// Drain timing and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub policy: DrainPolicy,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            policy: DrainPolicy::ForceRemove,
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Connections reached zero.
    Drained { elapsed: Duration },
    /// The deadline passed with connections still open.
    TimedOut { elapsed: Duration, remaining: u64 },
    /// The instance was removed by someone else mid-drain.
    Vanished,
}

/// Poll an instance's connection count until it reaches zero or the
/// timeout expires.
pub async fn drain(
    registry: &InstanceRegistry,
    instance_id: &str,
    config: &DrainConfig,
) -> DrainOutcome {
    let started = Instant::now();

    loop {
        let Some(connections) = registry.connections(instance_id) else {
            return DrainOutcome::Vanished;
        };
        let elapsed = started.elapsed();

        if connections == 0 {
            debug!(%instance_id, elapsed_ms = elapsed.as_millis() as u64, "instance drained");
            return DrainOutcome::Drained { elapsed };
        }
        if elapsed >= config.timeout {
            return DrainOutcome::TimedOut {
                elapsed,
                remaining: connections,
            };
        }

        debug!(%instance_id, connections, "waiting for connections to drain");
        let wait = config.poll_interval.min(config.timeout - elapsed);
        tokio::time::sleep(wait).await;
    }
}
