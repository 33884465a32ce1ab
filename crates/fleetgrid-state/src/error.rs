//! Error types for the FleetGrid control subsystem.

use thiserror::Error;

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors raised by configuration, scaling, and registry operations.
///
/// Health-probe failures never surface here: they are recorded on the
/// instance and reported through events instead.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("drain of {instance_id} aborted with {connections} connection(s) still open")]
    DrainAborted {
        instance_id: String,
        connections: u64,
    },

    #[error("instance registry has been shut down")]
    ShutDown,
}
