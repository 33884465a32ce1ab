//! fleetgrid-balancer: instance selection and the fleet control facade.
//!
//! [`LoadBalancer`] is the surface the request-routing layer talks to:
//! it picks an instance per unit of work, tracks connections around each
//! request, and owns the health-check and autoscaling background loops.
//!
//! # Components
//!
//! - **`strategy`**: the [`Selector`] trait and its five algorithms
//! - **`balancer`**: registry + selector + background tasks
//! - **`config`**: serde configuration for the whole subsystem
//!
//! # Selection
//!
//! Candidates are instances that are healthy and below their connection
//! ceiling. An empty candidate set yields `None`; backpressure policy is
//! the caller's call.

pub mod balancer;
pub mod config;
pub mod strategy;

pub use balancer::LoadBalancer;
pub use config::BalancerConfig;
pub use strategy::{Selector, build_selector, ip_hash};
