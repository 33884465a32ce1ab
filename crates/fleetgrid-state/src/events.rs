//! Lifecycle events and the bus that carries them.
//!
//! The bus is an explicit value handed to the registry and control loops,
//! not a global. Subscribers get a `broadcast::Receiver`; closing the bus
//! drops the sender so every receiver observes `RecvError::Closed`.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{InstanceId, ServerInstance};

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notification emitted on instance lifecycle and scaling changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    InstanceAdded { instance: ServerInstance },
    InstanceRemoved { instance: ServerInstance },
    ConnectionIncremented { instance_id: InstanceId, connections: u64 },
    ConnectionDecremented { instance_id: InstanceId, connections: u64 },
    InstanceHealthy { instance_id: InstanceId },
    InstanceUnhealthy { instance_id: InstanceId },
    ScaleUp { instance_id: InstanceId, timestamp: u64 },
    ScaleDown { instance_id: InstanceId, timestamp: u64 },
}

impl FleetEvent {
    /// Event name as consumed by alerting collaborators.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstanceAdded { .. } => "instanceAdded",
            Self::InstanceRemoved { .. } => "instanceRemoved",
            Self::ConnectionIncremented { .. } => "connectionIncremented",
            Self::ConnectionDecremented { .. } => "connectionDecremented",
            Self::InstanceHealthy { .. } => "instanceHealthy",
            Self::InstanceUnhealthy { .. } => "instanceUnhealthy",
            Self::ScaleUp { .. } => "scaleUp",
            Self::ScaleDown { .. } => "scaleDown",
        }
    }

    /// The instance this event concerns.
    pub fn instance_id(&self) -> &str {
        match self {
            Self::InstanceAdded { instance } | Self::InstanceRemoved { instance } => &instance.id,
            Self::ConnectionIncremented { instance_id, .. }
            | Self::ConnectionDecremented { instance_id, .. }
            | Self::InstanceHealthy { instance_id }
            | Self::InstanceUnhealthy { instance_id }
            | Self::ScaleUp { instance_id, .. }
            | Self::ScaleDown { instance_id, .. } => instance_id,
        }
    }
}

/// Fan-out channel for [`FleetEvent`]s.
///
/// Cloning the bus shares the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<RwLock<Option<broadcast::Sender<FleetEvent>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    /// Subscribe to all future events.
    ///
    /// After [`close`](Self::close) the returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        let sender = self.sender.read().expect("event bus lock");
        match sender.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Publish an event. Events with no subscribers are dropped.
    pub fn emit(&self, event: FleetEvent) {
        let sender = self.sender.read().expect("event bus lock");
        if let Some(tx) = sender.as_ref() {
            // Err only means nobody is listening.
            let _ = tx.send(event);
        }
    }

    /// Detach every subscriber. Idempotent.
    pub fn close(&self) {
        let mut sender = self.sender.write().expect("event bus lock");
        if sender.take().is_some() {
            debug!("event bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().expect("event bus lock").is_none()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .expect("event bus lock")
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.is_closed())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
