//! Outbound events for the integration layer.
//!
//! A single typed broadcast channel carries every event the engine emits.
//! Publishing never blocks and never fails: with no subscriber attached the
//! event is simply not delivered. Slow subscribers lag and lose old events.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::optimizer::ParameterChange;
use crate::engine::types::{DeviceId, TuningReason};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// A fire-and-forget notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub category: String,
    pub message: String,
    pub data: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Alert {
    pub fn new(
        level: AlertLevel,
        category: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            category: category.into(),
            message: message.into(),
            data,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Everything the engine publishes.
///
/// The variant name goes out in a `kind` field so that `resourceAlert` can
/// carry its resource under `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    HealthUpdate {
        cpu: f64,
        memory: f64,
        active_devices: usize,
        #[serde(rename = "uptime")]
        uptime_secs: u64,
    },
    PerformanceUpdate {
        packets_processed: u64,
        network_errors: u64,
        score: f64,
    },
    ResourceAlert {
        /// `cpu`, `memory` or `latency:<device>`
        #[serde(rename = "type")]
        resource: String,
        value: f64,
        threshold: f64,
        level: AlertLevel,
    },
    DeviceEvent {
        device_id: DeviceId,
        event: String,
        reliability: Option<f64>,
    },
    TuningApplied {
        reason: TuningReason,
        #[serde(rename = "changeSet")]
        changes: Vec<ParameterChange>,
    },
    Alert(Alert),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::HealthUpdate { .. } => "healthUpdate",
            EngineEvent::PerformanceUpdate { .. } => "performanceUpdate",
            EngineEvent::ResourceAlert { .. } => "resourceAlert",
            EngineEvent::DeviceEvent { .. } => "deviceEvent",
            EngineEvent::TuningApplied { .. } => "tuningApplied",
            EngineEvent::Alert(_) => "alert",
        }
    }
}

/// Typed event bus with a short memory of recent alerts.
pub struct AlertPublisher {
    tx: broadcast::Sender<EngineEvent>,
    recent: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        debug!("Publishing {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn alert(
        &self,
        level: AlertLevel,
        category: &str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        let alert = Alert::new(level, category, message, data);
        match level {
            AlertLevel::Info => info!("[{}] {}", alert.category, alert.message),
            AlertLevel::Warning => warn!("[{}] {}", alert.category, alert.message),
            AlertLevel::Error | AlertLevel::Critical => {
                error!("[{}] {} ({:?})", alert.category, alert.message, level)
            }
        }

        if self.capacity > 0 {
            let mut recent = self.recent.lock();
            while recent.len() >= self.capacity {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }
        self.publish(EngineEvent::Alert(alert));
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.recent.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let publisher = AlertPublisher::new(10);
        publisher.publish(EngineEvent::PerformanceUpdate {
            packets_processed: 1,
            network_errors: 0,
            score: 99.0,
        });
        assert!(publisher.recent_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_alert_reaches_subscriber() {
        let publisher = AlertPublisher::new(10);
        let mut rx = publisher.subscribe();
        publisher.alert(
            AlertLevel::Critical,
            "device",
            "recovery failed",
            serde_json::json!({ "device": "kitchen" }),
        );

        match rx.recv().await.unwrap() {
            EngineEvent::Alert(alert) => {
                assert_eq!(alert.level, AlertLevel::Critical);
                assert_eq!(alert.category, "device");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(publisher.recent_alerts().len(), 1);
    }

    #[test]
    fn test_recent_alerts_bounded() {
        let publisher = AlertPublisher::new(2);
        for i in 0..5 {
            publisher.alert(AlertLevel::Info, "test", format!("n{}", i), serde_json::Value::Null);
        }
        let recent = publisher.recent_alerts();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].message, "n4");
    }

    #[test]
    fn test_event_wire_names() {
        let event = EngineEvent::ResourceAlert {
            resource: "cpu".to_string(),
            value: 91.0,
            threshold: 80.0,
            level: AlertLevel::Warning,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "resourceAlert");
        assert_eq!(json["type"], "cpu");
        assert_eq!(json["level"], "warning");

        let event = EngineEvent::TuningApplied {
            reason: TuningReason::HighCpu,
            changes: vec![ParameterChange::WorkerCount { from: 4, to: 3 }],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "tuningApplied");
        assert_eq!(json["reason"], "high_cpu");
        assert_eq!(json["changeSet"][0]["to"], 3);

        let event = EngineEvent::HealthUpdate {
            cpu: 12.0,
            memory: 40.0,
            active_devices: 2,
            uptime_secs: 90,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["activeDevices"], 2);
        assert_eq!(json["uptime"], 90);
    }
}
