//! Device ("sign") model and the telemetry it reports with each heartbeat.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    #[default]
    Offline,
}

/// Which network path a sign is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    Primary,
    Cellular,
}

/// Telemetry carried by a heartbeat. Every field is optional: a missing
/// value keeps the last known one (see [`Telemetry::merge`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crowd_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crowd_density: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambient_noise_db: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_path: Option<PathKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_message_id: Option<String>,
}

impl Telemetry {
    pub fn merge(&mut self, update: &Telemetry) {
        fn keep<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }
        keep(&mut self.battery, &update.battery);
        keep(&mut self.signal_strength, &update.signal_strength);
        keep(&mut self.crowd_count, &update.crowd_count);
        keep(&mut self.crowd_density, &update.crowd_density);
        keep(&mut self.ambient_noise_db, &update.ambient_noise_db);
        keep(&mut self.network_path, &update.network_path);
        keep(&mut self.interface, &update.interface);
        keep(&mut self.uptime_seconds, &update.uptime_seconds);
        keep(&mut self.current_message_id, &update.current_message_id);
    }
}

/// Registration request sent once by a sign that has no persisted id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub name: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub hardware_id: Option<String>,
    #[serde(default = "default_display_type")]
    pub display_type: String,
    #[serde(default)]
    pub has_speaker: bool,
}

fn default_display_type() -> String {
    "led".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub hardware_id: Option<String>,
    pub display_type: String,
    #[serde(default)]
    pub has_speaker: bool,
    pub status: ConnectionStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub current_message_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Device {
    /// New devices start offline until their first heartbeat.
    pub fn register(reg: DeviceRegistration, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: reg.name,
            event_id: reg.event_id,
            zone_id: reg.zone_id,
            hardware_id: reg.hardware_id,
            display_type: reg.display_type,
            has_speaker: reg.has_speaker,
            status: ConnectionStatus::Offline,
            last_seen: None,
            telemetry: Telemetry::default(),
            current_message_id: None,
            created_at: now,
        }
    }

    pub fn record_heartbeat(&mut self, telemetry: &Telemetry, now: OffsetDateTime) {
        self.telemetry.merge(telemetry);
        if let Some(id) = &telemetry.current_message_id {
            self.current_message_id = Some(id.clone());
        }
        self.status = ConnectionStatus::Online;
        self.last_seen = Some(now);
    }

    pub fn is_online(&self) -> bool {
        self.status == ConnectionStatus::Online
    }

    /// Silent for at least `threshold`. A device never seen counts as silent.
    pub fn is_silent(&self, now: OffsetDateTime, threshold: time::Duration) -> bool {
        match self.last_seen {
            Some(seen) => now - seen >= threshold,
            None => true,
        }
    }
}
