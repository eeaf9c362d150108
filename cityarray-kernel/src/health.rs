use crate::dispatch::Dispatcher;
use crate::mqtt::AnalyticsBridge;
use crate::state::{new_state, Shared};
use crate::store::DeviceFilter;
use cityarray_contracts::MessageStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub consoles_connected: usize,
    pub devices_connected: usize,
    pub connected_device_ids: BTreeSet<String>,
    pub devices_total: usize,
    pub devices_online: usize,
    pub devices_offline: usize,
    pub messages_live: usize,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state("disabled".to_string()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, dispatcher: &Dispatcher) -> KernelHealth {
        let registry = dispatcher.registry();
        let devices = dispatcher
            .store()
            .list_devices(&DeviceFilter::default())
            .unwrap_or_else(|e| {
                warn!("health: store indisponible: {e}");
                Vec::new()
            });
        let online = devices.iter().filter(|d| d.is_online()).count();
        let messages_live = dispatcher
            .store()
            .list_messages()
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| matches!(m.status, MessageStatus::Pending | MessageStatus::Active | MessageStatus::Displayed))
                    .count()
            })
            .unwrap_or(0);

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            consoles_connected: registry.console_count(),
            devices_connected: registry.device_count(),
            connected_device_ids: registry.connected_device_ids(),
            devices_total: devices.len(),
            devices_online: online,
            devices_offline: devices.len() - online,
            messages_live,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto du health kernel
    pub fn spawn_health_publisher(&self, bridge: AnalyticsBridge, dispatcher: Dispatcher, every: Duration) {
        let health_tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let health = health_tracker.get_health(&dispatcher);
                bridge.publish_health(&health);
                debug!(
                    uptime = health.uptime_seconds,
                    devices = health.devices_connected,
                    "health publié"
                );
            }
        });
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(Ok(kb)) = rest.split_whitespace().next().map(str::parse::<u64>) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connection, ConnectionRegistry, Role};
    use crate::store::{JsonStore, SignStore};
    use cityarray_contracts::{Device, DeviceRegistration, Telemetry};
    use time::OffsetDateTime;

    #[test]
    fn test_health_counts() {
        let store = Arc::new(JsonStore::in_memory());
        let now = OffsetDateTime::now_utc();
        let mut online = Device::register(DeviceRegistration { name: "A".into(), ..Default::default() }, now);
        online.record_heartbeat(&Telemetry::default(), now);
        store.create_device(online.clone()).unwrap();
        store
            .create_device(Device::register(DeviceRegistration { name: "B".into(), ..Default::default() }, now))
            .unwrap();

        let dispatcher = Dispatcher::new(ConnectionRegistry::new(), store, None);
        let (console, _rx) = Connection::new(Role::Console);
        let (sign, _srx) = Connection::new(Role::Device(online.id.clone()));
        dispatcher.registry().register(console);
        dispatcher.registry().register(sign);

        let health = HealthTracker::new().get_health(&dispatcher);
        assert_eq!(health.consoles_connected, 1);
        assert_eq!(health.devices_connected, 1);
        assert!(health.connected_device_ids.contains(&online.id));
        assert_eq!(health.devices_total, 2);
        assert_eq!(health.devices_online, 1);
        assert_eq!(health.devices_offline, 1);
        assert_eq!(health.mqtt_status, "disabled");
    }
}
