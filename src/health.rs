use crate::model::{Checkpoint, Point};
use crate::storage::InputManagement;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Observable state of the whole process, fed by the consumer on every block
/// and read on every HTTP request boundary. The same numbers back the JSON
/// health object and the Prometheus exposition.
pub struct Health {
    connected: AtomicBool,
    most_recent_checkpoint: Mutex<Option<Checkpoint>>,
    most_recent_node_tip: Mutex<Option<Checkpoint>>,
    input_management: InputManagement,
    registry: Registry,
    gauge_checkpoint: IntGauge,
    gauge_node_tip: IntGauge,
    gauge_connection: IntGauge,
}

#[derive(Serialize)]
pub struct HealthSnapshot {
    pub connection_status: &'static str,
    pub most_recent_checkpoint: Option<Checkpoint>,
    pub most_recent_node_tip: Option<Checkpoint>,
    pub configuration: Configuration,
}

#[derive(Serialize)]
pub struct Configuration {
    pub input_management: &'static str,
}

impl Health {
    pub fn new(input_management: InputManagement) -> Arc<Health> {
        let registry = Registry::new();
        let gauge_checkpoint =
            IntGauge::new("kupo_most_recent_checkpoint", "Slot of the most recent checkpoint").expect("valid gauge");
        let gauge_node_tip =
            IntGauge::new("kupo_most_recent_node_tip", "Slot of the most recent node tip").expect("valid gauge");
        let gauge_connection =
            IntGauge::new("kupo_connection_status", "1 when connected to the block producer").expect("valid gauge");
        registry.register(Box::new(gauge_checkpoint.clone())).expect("fresh registry");
        registry.register(Box::new(gauge_node_tip.clone())).expect("fresh registry");
        registry.register(Box::new(gauge_connection.clone())).expect("fresh registry");
        Arc::new(Health {
            connected: AtomicBool::new(false),
            most_recent_checkpoint: Mutex::new(None),
            most_recent_node_tip: Mutex::new(None),
            input_management,
            registry,
            gauge_checkpoint,
            gauge_node_tip,
            gauge_connection,
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        self.gauge_connection.set(if connected { 1 } else { 0 });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_checkpoint(&self, checkpoint: Option<Checkpoint>) {
        if let Some(checkpoint) = &checkpoint {
            self.gauge_checkpoint.set(checkpoint.slot_no as i64);
        } else {
            self.gauge_checkpoint.set(0);
        }
        *self.most_recent_checkpoint.lock().expect("health poisoned") = checkpoint;
    }

    pub fn record_node_tip(&self, tip: &Point) {
        let tip = match tip {
            Point::Origin => None,
            Point::At { slot_no, header_hash } => Some(Checkpoint { slot_no: *slot_no, header_hash: *header_hash }),
        };
        if let Some(tip) = &tip {
            self.gauge_node_tip.set(tip.slot_no as i64);
        }
        *self.most_recent_node_tip.lock().expect("health poisoned") = tip;
    }

    pub fn most_recent_checkpoint(&self) -> Option<Checkpoint> {
        *self.most_recent_checkpoint.lock().expect("health poisoned")
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            connection_status: if self.is_connected() { "connected" } else { "disconnected" },
            most_recent_checkpoint: self.most_recent_checkpoint(),
            most_recent_node_tip: *self.most_recent_node_tip.lock().expect("health poisoned"),
            configuration: Configuration {
                input_management: match self.input_management {
                    InputManagement::RemoveSpentInputs => "remove_spent_inputs",
                    InputManagement::MarkSpentInputs => "mark_spent_inputs",
                },
            },
        }
    }

    /// Prometheus text exposition of the kupo gauges.
    pub fn prometheus_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer).expect("gauges encode to text");
        String::from_utf8(buffer).expect("prometheus text is utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeaderHash;

    #[test]
    fn snapshot_tracks_consumer_updates() {
        let health = Health::new(InputManagement::RemoveSpentInputs);
        assert_eq!(health.snapshot().connection_status, "disconnected");

        health.set_connected(true);
        health.record_checkpoint(Some(Checkpoint { slot_no: 42, header_hash: HeaderHash([1; 32]) }));
        health.record_node_tip(&Point::At { slot_no: 99, header_hash: HeaderHash([2; 32]) });

        let snapshot = health.snapshot();
        assert_eq!(snapshot.connection_status, "connected");
        assert_eq!(snapshot.most_recent_checkpoint.map(|c| c.slot_no), Some(42));
        assert_eq!(snapshot.most_recent_node_tip.map(|c| c.slot_no), Some(99));
        assert_eq!(snapshot.configuration.input_management, "remove_spent_inputs");
    }

    #[test]
    fn prometheus_exposition_carries_the_gauges() {
        let health = Health::new(InputManagement::MarkSpentInputs);
        health.set_connected(true);
        health.record_checkpoint(Some(Checkpoint { slot_no: 7, header_hash: HeaderHash([0; 32]) }));
        let text = health.prometheus_text();
        assert!(text.contains("kupo_most_recent_checkpoint 7"), "{}", text);
        assert!(text.contains("kupo_connection_status 1"), "{}", text);
        assert!(text.contains("kupo_most_recent_node_tip"), "{}", text);
    }
}
