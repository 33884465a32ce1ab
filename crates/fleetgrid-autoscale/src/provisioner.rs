//! Provisioner: the boundary to whatever actually creates instances.
//!
//! Real deployments plug in an orchestrator client. The synthetic
//! provisioner fabricates local instances and is the default.

use async_trait::async_trait;
use tracing::debug;

use fleetgrid_state::InstanceSpec;

/// Creates new backend instances on request.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision one instance. `sequence` starts at 1 and increases on
    /// every attempt, failed ones included.
    async fn provision(&self, sequence: u64) -> anyhow::Result<InstanceSpec>;

    /// Provisioner name (for logging).
    fn name(&self) -> &str;
}

/// Fabricates `auto-<n>` instances on consecutive ports of one host.
#[derive(Debug, Clone)]
pub struct SyntheticProvisioner {
    host: String,
    base_port: u16,
    weight: f64,
    max_connections: u64,
}

impl SyntheticProvisioner {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
            weight: 1.0,
            max_connections: 100,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u64) -> Self {
        self.max_connections = max_connections;
        self
    }
}

impl Default for SyntheticProvisioner {
    fn default() -> Self {
        Self::new("127.0.0.1", 4000)
    }
}

#[async_trait]
impl Provisioner for SyntheticProvisioner {
    async fn provision(&self, sequence: u64) -> anyhow::Result<InstanceSpec> {
        let port = u16::try_from(sequence)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no port left above {} for instance #{sequence}",
                    self.base_port
                )
            })?;

        let spec = InstanceSpec::new(format!("auto-{sequence}"), self.host.clone(), port)
            .with_weight(self.weight)
            .with_max_connections(self.max_connections);
        debug!(instance_id = %spec.id, port, "synthetic instance provisioned");
        Ok(spec)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
