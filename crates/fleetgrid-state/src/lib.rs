//! fleetgrid-state: in-memory fleet state for FleetGrid.
//!
//! Owns the set of backend instances and their live state (connection
//! counts, health flag, probe metrics), the configuration types shared by
//! the balancer, health checker, and autoscaler, and the lifecycle event
//! bus consumed by observability collaborators.
//!
//! # Architecture
//!
//! ```text
//! InstanceRegistry
//!   ├── slots: RwLock<Vec<Arc<InstanceSlot>>>   (insertion order preserved)
//!   │     ├── connections: AtomicU64            (request handlers)
//!   │     ├── healthy:     AtomicBool           (health checker)
//!   │     └── probe:       Mutex<ProbeState>    (health checker)
//!   ├── alive: AtomicBool                       (shutdown guard)
//!   └── EventBus ── broadcast::Sender<FleetEvent>
//! ```
//!
//! Nothing here is persisted. Instances self-register on startup, so a
//! restart simply rebuilds the registry.

pub mod error;
pub mod events;
pub mod registry;
pub mod types;

pub use error::{FleetError, FleetResult};
pub use events::{EventBus, FleetEvent};
pub use registry::{HealthTransition, InstanceRegistry};
pub use types::*;
