//! Instance registry: the single owner of fleet membership and live state.
//!
//! Membership changes take the write lock on the slot list. Per-instance
//! state is mutated through the slot itself (atomics for connections and
//! health, a small mutex for probe metrics), so request handlers, the
//! health checker, and the autoscaler never contend on the list lock for
//! hot-path updates.
//!
//! Unknown ids are always no-ops: a removal may race with a probe or a
//! connection release, and both sides must tolerate it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::types::*;

/// A change of an instance's health flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub instance_id: InstanceId,
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProbeState {
    last_health_check: u64,
    response_time: f64,
    cpu_usage: f64,
    memory_usage: f64,
}

/// Arena slot for one instance.
#[derive(Debug)]
struct InstanceSlot {
    id: InstanceId,
    host: String,
    port: u16,
    weight: f64,
    max_connections: u64,
    connections: AtomicU64,
    healthy: AtomicBool,
    probe: Mutex<ProbeState>,
}

impl InstanceSlot {
    fn new(spec: InstanceSpec) -> Self {
        Self {
            id: spec.id,
            host: spec.host,
            port: spec.port,
            weight: spec.weight,
            max_connections: spec.max_connections,
            connections: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            probe: Mutex::new(ProbeState {
                last_health_check: epoch_millis(),
                ..Default::default()
            }),
        }
    }

    fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> ServerInstance {
        let probe = *self.probe.lock().expect("probe state lock");
        ServerInstance {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight,
            current_connections: self.connections(),
            max_connections: self.max_connections,
            healthy: self.is_healthy(),
            last_health_check: probe.last_health_check,
            response_time: probe.response_time,
            cpu_usage: probe.cpu_usage,
            memory_usage: probe.memory_usage,
        }
    }
}

/// Owns every registered instance. Shared as `Arc<InstanceRegistry>`.
#[derive(Debug)]
pub struct InstanceRegistry {
    /// Registration order is iteration order; tie-breaks depend on it.
    slots: RwLock<Vec<Arc<InstanceSlot>>>,
    events: EventBus,
    alive: AtomicBool,
}

impl InstanceRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            events,
            alive: AtomicBool::new(true),
        }
    }

    /// The bus this registry publishes to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an instance as healthy with zero connections.
    ///
    /// Re-registering an existing id replaces it in place.
    pub fn add_instance(&self, spec: InstanceSpec) -> FleetResult<ServerInstance> {
        if self.is_closed() {
            return Err(FleetError::ShutDown);
        }

        let slot = Arc::new(InstanceSlot::new(spec));
        let instance = slot.snapshot();
        {
            let mut slots = self.slots.write().expect("registry lock");
            match slots.iter().position(|s| s.id == slot.id) {
                Some(idx) => slots[idx] = slot,
                None => slots.push(slot),
            }
        }

        info!(instance_id = %instance.id, endpoint = %instance.endpoint(), "instance added");
        self.events.emit(FleetEvent::InstanceAdded {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    /// Remove an instance. Returns its final state, or `None` if unknown.
    pub fn remove_instance(&self, id: &str) -> Option<ServerInstance> {
        if self.is_closed() {
            return None;
        }

        let removed = {
            let mut slots = self.slots.write().expect("registry lock");
            let idx = slots.iter().position(|s| s.id == id)?;
            slots.remove(idx)
        };

        let instance = removed.snapshot();
        info!(instance_id = %id, connections = instance.current_connections, "instance removed");
        self.events.emit(FleetEvent::InstanceRemoved {
            instance: instance.clone(),
        });
        Some(instance)
    }

    /// Record a new in-flight request. Returns the updated count.
    pub fn increment_connections(&self, id: &str) -> Option<u64> {
        if self.is_closed() {
            return None;
        }
        let slot = self.slot(id)?;
        let connections = slot.connections.fetch_add(1, Ordering::AcqRel) + 1;
        self.events.emit(FleetEvent::ConnectionIncremented {
            instance_id: slot.id.clone(),
            connections,
        });
        Some(connections)
    }

    /// Record a finished request. The count never drops below zero.
    pub fn decrement_connections(&self, id: &str) -> Option<u64> {
        if self.is_closed() {
            return None;
        }
        let slot = self.slot(id)?;
        let previous = slot
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or_default();
        let connections = previous.saturating_sub(1);
        self.events.emit(FleetEvent::ConnectionDecremented {
            instance_id: slot.id.clone(),
            connections,
        });
        Some(connections)
    }

    /// Current connection count for one instance.
    pub fn connections(&self, id: &str) -> Option<u64> {
        self.slot(id).map(|s| s.connections())
    }

    /// Apply a probe result. Returns a transition only when the health
    /// flag actually changed.
    pub fn apply_health_report(&self, id: &str, report: HealthReport) -> Option<HealthTransition> {
        if self.is_closed() {
            return None;
        }
        let slot = self.slot(id)?;

        {
            let mut probe = slot.probe.lock().expect("probe state lock");
            probe.last_health_check = epoch_millis();
            if let Some(rt) = report.response_time {
                probe.response_time = rt;
            }
            if let Some(usage) = report.resource_usage {
                probe.cpu_usage = usage.cpu_usage;
                probe.memory_usage = usage.memory_usage;
            }
        }

        let previous = slot.healthy.swap(report.healthy, Ordering::AcqRel);
        if previous == report.healthy {
            return None;
        }
        debug!(instance_id = %id, healthy = report.healthy, "health flag flipped");
        Some(HealthTransition {
            instance_id: slot.id.clone(),
            healthy: report.healthy,
        })
    }

    /// Snapshot of one instance.
    pub fn get_instance(&self, id: &str) -> Option<ServerInstance> {
        self.slot(id).map(|s| s.snapshot())
    }

    /// Snapshot of every instance in registration order.
    pub fn get_instances(&self) -> Vec<ServerInstance> {
        self.snapshot_where(|_| true)
    }

    /// Snapshot of the healthy instances in registration order.
    pub fn get_healthy_instances(&self) -> Vec<ServerInstance> {
        self.snapshot_where(|s| s.is_healthy())
    }

    /// Instances eligible for selection: healthy and below capacity.
    pub fn selectable_instances(&self) -> Vec<ServerInstance> {
        self.snapshot_where(|s| s.is_healthy() && s.connections() < s.max_connections)
    }

    pub fn len(&self) -> usize {
        self.slots.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn healthy_count(&self) -> usize {
        let slots = self.slots.read().expect("registry lock");
        slots.iter().filter(|s| s.is_healthy()).count()
    }

    /// Means of the scaling signals over the healthy subset.
    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        let healthy = self.get_healthy_instances();
        if healthy.is_empty() {
            return AggregateMetrics::default();
        }
        let n = healthy.len() as f64;
        AggregateMetrics {
            healthy_instances: healthy.len(),
            cpu_usage: healthy.iter().map(|i| i.cpu_usage).sum::<f64>() / n,
            memory_usage: healthy.iter().map(|i| i.memory_usage).sum::<f64>() / n,
            response_time: healthy.iter().map(|i| i.response_time).sum::<f64>() / n,
            connection_count: healthy.iter().map(|i| i.current_connections as f64).sum::<f64>()
                / n,
        }
    }

    /// Fleet-wide counts and healthy-subset means.
    pub fn instance_stats(&self) -> InstanceStats {
        let all = self.get_instances();
        let metrics = self.aggregate_metrics();
        InstanceStats {
            total_instances: all.len(),
            healthy_instances: metrics.healthy_instances,
            unhealthy_instances: all.len().saturating_sub(metrics.healthy_instances),
            total_connections: all.iter().map(|i| i.current_connections).sum(),
            avg_response_time: metrics.response_time,
            avg_cpu_usage: metrics.cpu_usage,
            avg_memory_usage: metrics.memory_usage,
        }
    }

    /// Stop accepting mutations. In-flight probe results arriving later
    /// are dropped.
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!("instance registry closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    fn slot(&self, id: &str) -> Option<Arc<InstanceSlot>> {
        let slots = self.slots.read().expect("registry lock");
        slots.iter().find(|s| s.id == id).cloned()
    }

    fn snapshot_where(&self, keep: impl Fn(&InstanceSlot) -> bool) -> Vec<ServerInstance> {
        let slots = self.slots.read().expect("registry lock");
        slots
            .iter()
            .filter(|s| keep(s))
            .map(|s| s.snapshot())
            .collect()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn registry_with(ids: &[&str]) -> InstanceRegistry {
        let registry = InstanceRegistry::default();
        for (i, id) in ids.iter().enumerate() {
            registry
                .add_instance(InstanceSpec::new(*id, "10.0.0.1", 8000 + i as u16))
                .unwrap();
        }
        registry
    }

    fn report(healthy: bool, rt: Option<f64>, usage: Option<(f64, f64)>) -> HealthReport {
        HealthReport {
            healthy,
            response_time: rt,
            resource_usage: usage.map(|(cpu_usage, memory_usage)| ResourceUsage {
                cpu_usage,
                memory_usage,
            }),
        }
    }

    #[test]
    fn add_registers_healthy_with_zero_connections() {
        let registry = InstanceRegistry::default();
        let inst = registry
            .add_instance(InstanceSpec::new("api-1", "10.0.0.1", 8080).with_weight(3.0))
            .unwrap();

        assert!(inst.healthy);
        assert_eq!(inst.current_connections, 0);
        assert_eq!(inst.weight, 3.0);
        assert!(inst.last_health_check > 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn count_tracks_adds_minus_removes() {
        let registry = registry_with(&["a", "b", "c", "d"]);
        assert!(registry.remove_instance("b").is_some());
        assert!(registry.remove_instance("b").is_none());
        assert!(registry.remove_instance("zzz").is_none());
        registry.add_instance(InstanceSpec::new("e", "10.0.0.9", 9000)).unwrap();

        assert_eq!(registry.get_instances().len(), 4);
        let ids: Vec<_> = registry.get_instances().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "c", "d", "e"]);
    }

    #[test]
    fn re_adding_an_id_replaces_in_place() {
        let registry = registry_with(&["a", "b"]);
        registry.increment_connections("a");
        registry
            .add_instance(InstanceSpec::new("a", "10.0.0.5", 9999))
            .unwrap();

        let instances = registry.get_instances();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "a");
        assert_eq!(instances[0].port, 9999);
        assert_eq!(instances[0].current_connections, 0);
    }

    #[test]
    fn decrement_floors_at_zero() {
        let registry = registry_with(&["a"]);
        assert_eq!(registry.increment_connections("a"), Some(1));
        assert_eq!(registry.decrement_connections("a"), Some(0));
        assert_eq!(registry.decrement_connections("a"), Some(0));
        assert_eq!(registry.connections("a"), Some(0));
    }

    #[test]
    fn unknown_ids_are_noops() {
        let registry = registry_with(&["a"]);
        assert_eq!(registry.increment_connections("ghost"), None);
        assert_eq!(registry.decrement_connections("ghost"), None);
        assert_eq!(registry.apply_health_report("ghost", report(false, None, None)), None);
    }

    #[test]
    fn concurrent_connection_updates_are_not_lost() {
        let registry = Arc::new(registry_with(&["a"]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        registry.increment_connections("a");
                    }
                    for _ in 0..500 {
                        registry.decrement_connections("a");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.connections("a"), Some(8 * 500));
    }

    #[test]
    fn health_report_returns_transition_only_on_flip() {
        let registry = registry_with(&["a"]);

        assert_eq!(registry.apply_health_report("a", report(true, Some(12.0), None)), None);
        let down = registry.apply_health_report("a", report(false, None, None));
        assert_eq!(
            down,
            Some(HealthTransition {
                instance_id: "a".into(),
                healthy: false
            })
        );
        assert_eq!(registry.apply_health_report("a", report(false, None, None)), None);
        assert!(registry.apply_health_report("a", report(true, Some(5.0), None)).is_some());
    }

    #[test]
    fn transport_failure_preserves_metrics() {
        let registry = registry_with(&["a"]);
        registry.apply_health_report("a", report(true, Some(40.0), Some((55.0, 60.0))));
        let before = registry.get_instance("a").unwrap();

        registry.apply_health_report("a", report(false, None, None));
        let after = registry.get_instance("a").unwrap();

        assert!(!after.healthy);
        assert_eq!(after.response_time, 40.0);
        assert_eq!(after.cpu_usage, 55.0);
        assert_eq!(after.memory_usage, 60.0);
        assert!(after.last_health_check >= before.last_health_check);
    }

    #[test]
    fn selectable_filters_unhealthy_and_full() {
        let registry = InstanceRegistry::default();
        registry
            .add_instance(InstanceSpec::new("full", "h", 1).with_max_connections(1))
            .unwrap();
        registry.add_instance(InstanceSpec::new("sick", "h", 2)).unwrap();
        registry.add_instance(InstanceSpec::new("ok", "h", 3)).unwrap();

        registry.increment_connections("full");
        registry.apply_health_report("sick", report(false, None, None));

        let ids: Vec<_> = registry
            .selectable_instances()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["ok"]);
        assert_eq!(registry.healthy_count(), 2);
    }

    #[test]
    fn stats_average_over_healthy_only() {
        let registry = registry_with(&["a", "b", "c"]);
        registry.apply_health_report("a", report(true, Some(10.0), Some((40.0, 20.0))));
        registry.apply_health_report("b", report(true, Some(30.0), Some((60.0, 40.0))));
        registry.apply_health_report("c", report(false, Some(900.0), None));
        registry.increment_connections("c");

        let stats = registry.instance_stats();
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.healthy_instances, 2);
        assert_eq!(stats.unhealthy_instances, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.avg_response_time, 20.0);
        assert_eq!(stats.avg_cpu_usage, 50.0);
        assert_eq!(stats.avg_memory_usage, 30.0);
    }

    #[test]
    fn stats_are_zero_without_healthy_instances() {
        let registry = registry_with(&["a"]);
        registry.apply_health_report("a", report(false, Some(100.0), None));

        let stats = registry.instance_stats();
        assert_eq!(stats.healthy_instances, 0);
        assert_eq!(stats.avg_response_time, 0.0);
        assert_eq!(registry.aggregate_metrics(), AggregateMetrics::default());
    }

    #[tokio::test]
    async fn mutations_emit_events() {
        let registry = InstanceRegistry::default();
        let mut rx = registry.events().subscribe();

        registry.add_instance(InstanceSpec::new("a", "h", 1)).unwrap();
        registry.increment_connections("a");
        registry.decrement_connections("a");
        registry.remove_instance("a");

        let names: Vec<_> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.name())
        .collect();
        assert_eq!(
            names,
            vec![
                "instanceAdded",
                "connectionIncremented",
                "connectionDecremented",
                "instanceRemoved"
            ]
        );
    }

    #[test]
    fn closed_registry_drops_mutations() {
        let registry = registry_with(&["a"]);
        registry.close();
        registry.close();

        assert!(matches!(
            registry.add_instance(InstanceSpec::new("b", "h", 2)),
            Err(FleetError::ShutDown)
        ));
        assert_eq!(registry.increment_connections("a"), None);
        assert_eq!(registry.apply_health_report("a", report(false, None, None)), None);
        assert!(registry.remove_instance("a").is_none());
        assert!(registry.get_instance("a").unwrap().healthy);
    }
}
