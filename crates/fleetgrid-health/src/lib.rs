//! fleetgrid-health: health checking for FleetGrid instances.
//!
//! Probes every registered instance on a fixed interval, records health,
//! latency, and reported resource usage in the registry, and emits an
//! event whenever an instance's health flag flips.
//!
//! # Architecture
//!
//! ```text
//! HealthChecker
//!   ├── run(interval, shutdown) → run_cycle() on every tick
//!   └── run_cycle()
//!         ├── JoinSet: one task per instance
//!         │     ├── Prober::probe() → ProbeOutcome
//!         │     └── InstanceRegistry::apply_health_report()
//!         └── settle all tasks → CycleReport
//! ```
//!
//! # Probe semantics
//!
//! - 2xx: healthy, latency recorded, `metrics.resourceUsage` parsed (0 if absent)
//! - non-2xx: unhealthy, latency recorded, resource metrics kept
//! - no response: unhealthy, latency and resource metrics kept
//!
//! Events fire only on a flip, never once per probe.

pub mod checker;
pub mod monitor;

pub use checker::{HealthCheckConfig, HttpProber, ProbeOutcome, Prober};
pub use monitor::{CycleReport, HealthChecker};
