//! fleetgrid-autoscale: threshold-driven fleet scaling.
//!
//! Reads mean metrics over the healthy instance set, compares them with
//! the configured thresholds, and adds or drains one instance per cycle.
//!
//! # Scaling Algorithm
//!
//! ```text
//! if now - last_action < cooldown:            skip cycle
//!
//! m = mean(cpu, memory, response_time, connections) over healthy
//!
//! if healthy < max and ANY m > scale_up_threshold:
//!     last_action = now            // before provisioning
//!     Provisioner::provision() → add_instance() → ScaleUp event
//!
//! elif healthy > min and ALL m < scale_down_threshold:
//!     target = healthy instance with fewest connections (first wins)
//!     drain(target)                // poll 1s, up to 30s
//!     remove_instance(target)      // DrainPolicy::ForceRemove
//!     last_action = now → ScaleDown event
//! ```
//!
//! One cooldown timestamp is shared by both directions. A failed
//! provisioning attempt still consumes it, which throttles retries
//! against a provisioner that keeps failing.

pub mod drain;
pub mod provisioner;
pub mod scaler;

pub use drain::{DrainConfig, DrainOutcome, DrainPolicy};
pub use provisioner::{Provisioner, SyntheticProvisioner};
pub use scaler::{AutoScaler, ScaleDecision, ScalerConfig, ScalingOutcome};
